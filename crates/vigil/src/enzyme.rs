//! Cleavage rules, used to decide whether a peptide is an enzymatically
//! plausible product of a protein

use crate::mass::VALID_AA;
use crate::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct EnzymeBuilder {
    pub cleave_at: Option<String>,
    pub restrict: Option<char>,
    pub c_terminal: Option<bool>,
}

impl Default for EnzymeBuilder {
    fn default() -> Self {
        Self {
            cleave_at: Some("KR".into()),
            restrict: Some('P'),
            c_terminal: Some(true),
        }
    }
}

impl EnzymeBuilder {
    pub fn build(&self) -> Result<Option<Enzyme>, Error> {
        Enzyme::new(
            self.cleave_at.as_deref().unwrap_or("KR"),
            self.restrict,
            self.c_terminal.unwrap_or(true),
        )
    }
}

#[derive(Clone, Debug)]
pub struct Enzyme {
    // Skip cleaving if the site is followed matching this AA
    pub skip_suffix: Option<char>,
    // Regex for matching cleavage sites
    regex: Regex,
    // Cleave at c-terminal?
    pub c_terminal: bool,
}

impl Enzyme {
    /// `cleave` may be empty (non-specific, every peptide is plausible), "$"
    /// (no cleavage inside the protein) or a set of residues
    pub fn new(cleave: &str, skip_suffix: Option<char>, c_terminal: bool) -> Result<Option<Self>, Error> {
        if !(cleave.chars().all(|x| VALID_AA.contains(&(x as u8))) || cleave == "$") {
            return Err(Error::InvalidConfig(format!(
                "enzyme cleavage sequence contains non-amino acid characters: {}",
                cleave
            )));
        }
        if let Some(skip) = skip_suffix {
            if !VALID_AA.contains(&(skip as u8)) {
                return Err(Error::InvalidConfig(format!(
                    "enzyme cleavage restriction is non-amino acid character: {}",
                    skip
                )));
            }
        }

        let regex = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::InvalidConfig(format!("enzyme: {}", e)))
        };

        match cleave {
            "" => Ok(None),
            "$" => Ok(Some(Enzyme {
                regex: regex("$")?,
                skip_suffix: None,
                c_terminal: true,
            })),
            _ => Ok(Some(Enzyme {
                regex: regex(&format!("[{}]", cleave))?,
                skip_suffix,
                c_terminal,
            })),
        }
    }

    /// Boundaries (index of the first residue after the cut) at which this
    /// enzyme cleaves `sequence`
    pub fn cleavage_sites(&self, sequence: &str) -> Vec<usize> {
        let mut sites = Vec::new();
        for mat in self.regex.find_iter(sequence) {
            let site = match self.c_terminal {
                true => mat.end(),
                false => mat.start(),
            };
            if let Some(skip) = self.skip_suffix {
                if site < sequence.len() && sequence[site..].starts_with(skip) {
                    continue;
                }
            }
            if site > 0 && site < sequence.len() {
                sites.push(site);
            }
        }
        sites
    }

    /// Is `protein[start..end]` produced by this enzyme? Protein termini
    /// always count as cleavage sites, as does the bond after an initiator
    /// methionine.
    pub fn is_enzymatic(&self, protein: &str, start: usize, end: usize) -> bool {
        let sites = self.cleavage_sites(protein);
        let n_term = start == 0
            || (start == 1 && protein.starts_with('M'))
            || sites.binary_search(&start).is_ok();
        let c_term = end >= protein.len() || sites.binary_search(&end).is_ok();
        n_term && c_term
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn trypsin() -> Enzyme {
        EnzymeBuilder::default().build().unwrap().unwrap()
    }

    #[test]
    fn trypsin_sites() {
        let sites = trypsin().cleavage_sites("MAKPEKRLESK");
        // K-P is restricted
        assert_eq!(sites, vec![6, 7]);
    }

    #[test]
    fn enzymatic_products() {
        let protein = "MAKVLESKPEPTIDERGGK";
        let t = trypsin();
        // M.AK|VLESKPEPTIDER|GGK
        assert!(t.is_enzymatic(protein, 3, 16));
        assert!(t.is_enzymatic(protein, 1, 3));
        assert!(t.is_enzymatic(protein, 16, 19));
        assert!(!t.is_enzymatic(protein, 4, 16));
        assert!(!t.is_enzymatic(protein, 3, 8));
    }

    #[test]
    fn nonspecific_enzyme() {
        assert!(Enzyme::new("", None, true).unwrap().is_none());
        assert!(Enzyme::new("KZ", None, true).is_err());
    }
}
