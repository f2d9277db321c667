pub mod cache;
pub mod config;
pub mod enzyme;
pub mod executor;
pub mod fasta;
pub mod grouping;
pub mod ident;
pub mod inference;
pub mod ions;
pub mod kde;
pub mod localization;
pub mod mass;
pub mod modification;
pub mod pipeline;
pub mod progress;
pub mod score_map;
pub mod scorer;
pub mod sequence;
pub mod store;
pub mod threshold;

use ident::MatchKey;

#[derive(Debug)]
pub enum Error {
    /// A peptide could not be mapped back to any protein of the database
    UnmappedPeptide { peptide: String, decoy_tag: String },
    /// Protein metadata requested for an accession unknown to the database
    MissingProtein(String),
    /// A match key was expected in the store but is absent
    MissingMatch(MatchKey),
    /// A record of the wrong kind was found under a key
    UnexpectedMatch(MatchKey),
    InvalidConfig(String),
    /// The run was canceled before the named stage could finish
    Canceled(&'static str),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnmappedPeptide { peptide, decoy_tag } => write!(
                f,
                "peptide {} does not map to any protein of the sequence database. \
                 Check that the database version matches the one used for the search \
                 and that decoy accessions carry the `{}` tag",
                peptide, decoy_tag
            ),
            Self::MissingProtein(acc) => write!(f, "protein {} is not in the sequence database", acc),
            Self::MissingMatch(key) => write!(f, "match {} is missing from the store", key),
            Self::UnexpectedMatch(key) => write!(f, "match {} has an unexpected kind", key),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Canceled(stage) => write!(f, "canceled during {}", stage),
            Self::Io(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

pub fn read_json<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<std::path::Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn read_fasta<P: AsRef<std::path::Path>>(path: P, decoy_tag: &str) -> Result<fasta::Fasta, Error> {
    let contents = std::fs::read_to_string(path)?;
    Ok(fasta::Fasta::parse(contents, decoy_tag))
}
