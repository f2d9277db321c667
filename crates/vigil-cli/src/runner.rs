use crate::input::Settings;
use anyhow::{ensure, Context};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use vigil_core::cache::{MemoryGuard, SequenceCache};
use vigil_core::executor::ThreadPoolExecutor;
use vigil_core::ident::{Match, SpectrumMatch};
use vigil_core::pipeline::{RunStatus, Services, ValidationPipeline, ValidationResult};
use vigil_core::progress::LogProgress;
use vigil_core::store::MemoryStore;
use vigil_core::threshold::ValidationSummary;

pub struct Runner {
    pub settings: Settings,
    pub(crate) store: MemoryStore,
    pub(crate) cache: SequenceCache,
    start: Instant,
}

#[derive(Serialize)]
struct Report<'a> {
    settings: &'a Settings,
    result: &'a ValidationResult,
}

fn accuracy_warning(level: &str, summary: &ValidationSummary) -> Option<String> {
    match summary.accuracy_warning {
        true => Some(format!(
            "{} FDR estimated at {:.2}% but {:.2}% of the accepted {} are decoys",
            level, summary.fdr_limit, summary.empirical_fdr, level
        )),
        false => None,
    }
}

fn summarize(level: &str, summary: Option<&ValidationSummary>) {
    if let Some(summary) = summary {
        info!(
            "validated {} target {} at {}% FDR (estimated {:.0} true positives)",
            summary.validated, level, summary.target_fdr, summary.estimated_true_positives
        );
        if let Some(warning) = accuracy_warning(level, summary) {
            log::warn!("{}", warning);
        }
    }
}

impl Runner {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let start = Instant::now();
        let enzyme = settings.scoring.enzyme.build()?;
        let fasta = vigil_core::read_fasta(&settings.fasta, &settings.scoring.decoy_tag)
            .with_context(|| format!("Failed to build database from `{}`", settings.fasta))?
            .with_enzyme(enzyme);
        ensure!(
            !fasta.is_empty(),
            "no protein sequences found in `{}`",
            settings.fasta
        );
        info!(
            "loaded {} protein sequences in {}ms",
            fasta.len(),
            start.elapsed().as_millis()
        );

        let spectra: Vec<SpectrumMatch> = vigil_core::read_json(&settings.identifications)
            .with_context(|| {
                format!(
                    "Failed to read identifications from `{}`",
                    settings.identifications
                )
            })?;
        ensure!(
            !spectra.is_empty(),
            "no spectrum matches found in `{}`",
            settings.identifications
        );
        info!("loaded {} spectrum matches", spectra.len());

        let store = spectra.into_iter().map(Match::Spectrum).collect();
        Ok(Self {
            settings,
            store,
            cache: SequenceCache::new(Arc::new(fasta)),
            start,
        })
    }

    pub(crate) fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        let mut path = self.settings.output_directory.clone();
        path.push(file_name.as_ref());
        path
    }

    pub fn run(mut self, threads: usize) -> anyhow::Result<ValidationResult> {
        let progress = LogProgress::default();
        let executor = ThreadPoolExecutor::new(threads)?;
        info!("validating with {} worker threads", executor.threads());
        let scoring = &self.settings.scoring;
        let memory = MemoryGuard::system(
            scoring.memory_fraction,
            scoring.critical_memory_fraction,
            scoring.cache_reduction,
        );

        let result = {
            let services = Services {
                store: &self.store,
                cache: &self.cache,
                progress: &progress,
                executor: &executor,
                memory: Some(&memory),
            };
            let mut pipeline = ValidationPipeline::new(scoring.clone(), services);
            pipeline.run().context("Validation failed")?;
            pipeline.into_result()
        };

        if let RunStatus::Incomplete { stage } = result.status {
            log::warn!(
                "run is incomplete: `{}` and later stages were not completed",
                stage.name()
            );
        }
        summarize("spectrum matches", result.psm_summary.as_ref());
        summarize("peptides", result.peptide_summary.as_ref());
        summarize("protein groups", result.protein_summary.as_ref());
        if let Some(cutoff) = result.flr_cutoff {
            info!(
                "site probabilities above {:.3} are confident at {}% FLR",
                cutoff, self.settings.scoring.flr_threshold
            );
        }
        for suspicion in &result.suspicions {
            log::warn!(
                "suspicious {} score map, category `{}`: {:?}",
                suspicion.map,
                suspicion.category,
                suspicion.reason
            );
        }

        log::trace!("writing outputs");
        let psms = self.write_psms()?;
        self.settings.output_paths.push(psms);
        let peptides = self.write_peptides()?;
        self.settings.output_paths.push(peptides);
        let proteins = self.write_proteins()?;
        self.settings.output_paths.push(proteins);

        let path = self.make_path("results.json");
        self.settings.output_paths.push(path.display().to_string());
        let bytes = serde_json::to_vec_pretty(&Report {
            settings: &self.settings,
            result: &result,
        })?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(result)
    }
}
