use anyhow::{ensure, Context};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vigil_core::config::{ScoringConfig, ScoringOptions};

#[derive(Serialize)]
/// Actual run parameters - may include overrides or default values not set by user
pub struct Settings {
    pub version: String,
    pub fasta: String,
    pub identifications: String,
    pub scoring: ScoringConfig,
    pub output_directory: PathBuf,
    pub output_paths: Vec<String>,
}

#[derive(Deserialize, Default)]
/// Input parameters as read from the JSON parameter file
pub struct Input {
    pub fasta: Option<String>,
    pub identifications: Option<String>,
    pub output_directory: Option<String>,
    #[serde(flatten)]
    pub scoring: ScoringOptions,
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be set")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(fasta) = matches.get_one::<String>("fasta") {
            log::trace!("overriding `fasta` parameter.");
            input.fasta = Some(fasta.into());
        }
        if let Some(identifications) = matches.get_one::<String>("identifications") {
            log::trace!("overriding `identifications` parameter.");
            input.identifications = Some(identifications.into());
        }

        ensure!(
            input.fasta.is_some(),
            "`fasta` must be set. For more information try '--help'"
        );
        ensure!(
            input.identifications.is_some(),
            "`identifications` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        vigil_core::read_json(path).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Settings> {
        let scoring = self.scoring.build()?;
        let fasta = self.fasta.context("`fasta` must be set")?;
        let identifications = self
            .identifications
            .context("`identifications` must be set")?;

        let output_directory = match self.output_directory {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&output_directory).with_context(|| {
            format!(
                "Failed to create output directory `{}`",
                output_directory.display()
            )
        })?;

        Ok(Settings {
            version: env!("CARGO_PKG_VERSION").into(),
            fasta,
            identifications,
            scoring,
            output_directory,
            output_paths: Vec::new(),
        })
    }
}
