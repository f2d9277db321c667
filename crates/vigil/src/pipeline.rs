//! Stage orchestration.
//!
//! A run walks the match hierarchy bottom-up, one stage at a time. Every
//! stage fans its work out over match keys through the injected
//! [`Executor`] and publishes complete records to the [`MatchStore`]; the
//! next stage only starts once all of them are committed. Between stages the
//! memory guard gets a chance to shrink the sequence cache, or to cancel the
//! run when memory stays critical.

use crate::cache::{MemoryGuard, MemoryStatus, SequenceCache};
use crate::config::ScoringConfig;
use crate::executor::Executor;
use crate::grouping::{ProteinGroupResolver, ResolutionReport};
use crate::ident::{Match, MatchKey, MatchKind, PeptideMatch, SpectrumMatch};
use crate::inference::infer;
use crate::localization::{aggregate, apply_cutoff, to_protein, Localization, PTMLocalizationScorer};
use crate::progress::ProgressSink;
use crate::score_map::{CategoryKey, ScoreMap, Suspicion};
use crate::scorer::{modification_profile, ProbabilisticScorer};
use crate::store::MatchStore;
use crate::threshold::{ValidationSummary, ValidationThresholder};
use crate::Error;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PsmScoring,
    PsmValidation,
    PeptideScoring,
    PeptideValidation,
    ProteinGrouping,
    ProteinScoring,
    ProteinValidation,
    Inference,
    Localization,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::PsmScoring,
        Stage::PsmValidation,
        Stage::PeptideScoring,
        Stage::PeptideValidation,
        Stage::ProteinGrouping,
        Stage::ProteinScoring,
        Stage::ProteinValidation,
        Stage::Inference,
        Stage::Localization,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::PsmScoring => "PSM scoring",
            Stage::PsmValidation => "PSM validation",
            Stage::PeptideScoring => "peptide scoring",
            Stage::PeptideValidation => "peptide validation",
            Stage::ProteinGrouping => "protein grouping",
            Stage::ProteinScoring => "protein scoring",
            Stage::ProteinValidation => "protein validation",
            Stage::Inference => "protein inference",
            Stage::Localization => "modification localization",
        }
    }

    fn next(&self) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|stage| stage > self)
    }

    /// Earliest stage whose output depends on a setting that differs
    /// between `old` and `new`
    pub fn affected_by(old: &ScoringConfig, new: &ScoringConfig) -> Option<Stage> {
        let changed = [
            (
                old.pep_estimator != new.pep_estimator
                    || old.pep_window != new.pep_window
                    || old.min_decoys != new.min_decoys
                    || old.monotonic_tolerance != new.monotonic_tolerance,
                Stage::PsmScoring,
            ),
            (
                old.target_psm_fdr != new.target_psm_fdr || old.confident_pep != new.confident_pep,
                Stage::PsmValidation,
            ),
            (old.target_peptide_fdr != new.target_peptide_fdr, Stage::PeptideValidation),
            (
                old.enzyme != new.enzyme
                    || old.sequence_matching != new.sequence_matching
                    || old.decoy_tag != new.decoy_tag
                    || old.group_small_subgroups != new.group_small_subgroups,
                Stage::ProteinGrouping,
            ),
            (old.target_protein_fdr != new.target_protein_fdr, Stage::ProteinValidation),
            (
                old.flr_threshold != new.flr_threshold
                    || old.probabilistic_score != new.probabilistic_score
                    || old.account_neutral_losses != new.account_neutral_losses
                    || old.min_isotopic_correction != new.min_isotopic_correction
                    || old.max_isotopic_correction != new.max_isotopic_correction
                    || old.fragment_tolerance != new.fragment_tolerance
                    || old.variable_mods != new.variable_mods,
                Stage::Localization,
            ),
        ];
        changed
            .iter()
            .filter(|(changed, _)| *changed)
            .map(|(_, stage)| *stage)
            .min()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// `stage` and everything after it were not committed
    Incomplete { stage: Stage },
}

/// Final maps and statistics of a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: RunStatus,
    pub engines: BTreeMap<String, ScoreMap<u8>>,
    pub psm_map: ScoreMap<u8>,
    pub peptide_map: ScoreMap<String>,
    pub protein_map: ScoreMap<()>,
    pub flr_map: ScoreMap<()>,
    pub psm_summary: Option<ValidationSummary>,
    pub peptide_summary: Option<ValidationSummary>,
    pub protein_summary: Option<ValidationSummary>,
    /// Lowest confident site probability
    pub flr_cutoff: Option<f64>,
    pub suspicions: Vec<Suspicion>,
    pub resolution: Option<ResolutionReport>,
}

impl ValidationResult {
    fn new(config: &ScoringConfig) -> Self {
        Self {
            status: RunStatus::Incomplete {
                stage: Stage::PsmScoring,
            },
            engines: BTreeMap::new(),
            psm_map: ScoreMap::configured("psm", config),
            peptide_map: ScoreMap::configured("peptide", config),
            protein_map: ScoreMap::configured("protein", config),
            flr_map: ScoreMap::configured("flr", config),
            psm_summary: None,
            peptide_summary: None,
            protein_summary: None,
            flr_cutoff: None,
            suspicions: Vec::new(),
            resolution: None,
        }
    }

    /// Replace the suspicious-input warnings of one map
    fn suspect<K: CategoryKey>(&mut self, map: &ScoreMap<K>, target_fdr: f64) {
        self.suspicions.retain(|s| s.map != map.name);
        self.suspicions.extend(map.suspicious_input(target_fdr));
    }
}

/// Everything the pipeline reads from or writes to
#[derive(Copy, Clone)]
pub struct Services<'a> {
    pub store: &'a dyn MatchStore,
    pub cache: &'a SequenceCache,
    pub progress: &'a dyn ProgressSink,
    pub executor: &'a dyn Executor,
    pub memory: Option<&'a MemoryGuard>,
}

impl<'a> Services<'a> {
    /// Run `job` once per key, stopping early on cancellation or on the
    /// first error
    fn for_each(
        &self,
        stage: Stage,
        keys: &[MatchKey],
        job: &(dyn Fn(&MatchKey) -> Result<(), Error> + Sync),
    ) -> Result<(), Error> {
        let progress = self.progress;
        self.executor.execute(keys.len(), &|ix| {
            if progress.is_canceled() {
                return Err(Error::Canceled(stage.name()));
            }
            job(&keys[ix])?;
            progress.increment_counter();
            Ok(())
        })
    }

    fn spectra(&self, keys: &[MatchKey]) -> Vec<SpectrumMatch> {
        self.store
            .iterate(MatchKind::Spectrum, keys)
            .filter_map(Match::into_spectrum)
            .collect()
    }

    fn peptides(&self, keys: &[MatchKey]) -> Vec<PeptideMatch> {
        self.store
            .iterate(MatchKind::Peptide, keys)
            .filter_map(Match::into_peptide)
            .collect()
    }
}

pub struct ValidationPipeline<'a> {
    config: ScoringConfig,
    services: Services<'a>,
    result: ValidationResult,
    /// Last committed stage
    completed: Option<Stage>,
    /// Parent proteins must be looked up again instead of reusing the
    /// accessions recorded on peptides
    remap: bool,
}

impl<'a> ValidationPipeline<'a> {
    pub fn new(config: ScoringConfig, services: Services<'a>) -> Self {
        Self {
            result: ValidationResult::new(&config),
            config,
            services,
            completed: None,
            remap: false,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn result(&self) -> &ValidationResult {
        &self.result
    }

    pub fn into_result(self) -> ValidationResult {
        self.result
    }

    /// Run every stage
    pub fn run(&mut self) -> Result<&ValidationResult, Error> {
        self.completed = None;
        self.run_from(Stage::PsmScoring)
    }

    /// Apply new parameters, re-running only the stages that depend on the
    /// settings that changed
    pub fn revalidate(&mut self, config: ScoringConfig) -> Result<&ValidationResult, Error> {
        let stage = Stage::affected_by(&self.config, &config);
        if self.config.enzyme != config.enzyme
            || self.config.sequence_matching != config.sequence_matching
            || self.config.decoy_tag != config.decoy_tag
        {
            self.remap = true;
        }
        self.config = config;
        match stage {
            Some(stage) => self.run_from(stage),
            None => {
                log::info!("parameters changed, no stage needs to be re-run");
                Ok(&self.result)
            }
        }
    }

    /// Re-run `stage` and everything downstream of it, e.g. after match
    /// records were edited in the store. Stages that never completed are
    /// run as well.
    pub fn run_from(&mut self, stage: Stage) -> Result<&ValidationResult, Error> {
        let pending = match self.completed {
            Some(done) => done.next(),
            None => Some(Stage::PsmScoring),
        };
        let start = match pending {
            Some(pending) if pending < stage => pending,
            _ => stage,
        };
        self.completed = Stage::ALL.iter().copied().filter(|s| *s < start).max();

        let time = Instant::now();
        for stage in Stage::ALL.iter().copied().filter(|s| *s >= start) {
            if self.services.progress.is_canceled() {
                return self.interrupt(stage);
            }
            self.services.progress.report(&format!("-  {}", stage.name()));
            match self.execute(stage) {
                Ok(()) => {}
                Err(Error::Canceled(_)) => return self.interrupt(stage),
                Err(e) => {
                    self.result.status = RunStatus::Incomplete { stage };
                    return Err(e);
                }
            }
            self.completed = Some(stage);
            self.barrier();
        }

        self.result.status = RunStatus::Complete;
        info!("validation finished in {}ms", time.elapsed().as_millis());
        Ok(&self.result)
    }

    fn interrupt(&mut self, stage: Stage) -> Result<&ValidationResult, Error> {
        log::warn!("run canceled, {} and later stages were not completed", stage.name());
        self.result.status = RunStatus::Incomplete { stage };
        Ok(&self.result)
    }

    fn barrier(&self) {
        let guard = match self.services.memory {
            Some(guard) => guard,
            None => return,
        };
        if let MemoryStatus::Critical { evicted } = guard.relieve(self.services.cache) {
            log::error!(
                "memory usage still critical after evicting {} cached lookups, canceling",
                evicted
            );
            self.services.progress.set_canceled();
        }
    }

    fn execute(&mut self, stage: Stage) -> Result<(), Error> {
        let time = Instant::now();
        match stage {
            Stage::PsmScoring => self.score_spectra()?,
            Stage::PsmValidation => self.validate_spectra()?,
            Stage::PeptideScoring => self.score_peptides()?,
            Stage::PeptideValidation => self.validate_peptides()?,
            Stage::ProteinGrouping => self.group_proteins()?,
            Stage::ProteinScoring => self.score_proteins()?,
            Stage::ProteinValidation => self.validate_proteins()?,
            Stage::Inference => self.infer()?,
            Stage::Localization => self.localize()?,
        }
        info!("-  {} done in {}ms", stage.name(), time.elapsed().as_millis());
        Ok(())
    }

    fn score_spectra(&mut self) -> Result<(), Error> {
        let services = self.services;
        let keys = services.store.keys(MatchKind::Spectrum);
        let scorer = ProbabilisticScorer::fit(&self.config, &services.spectra(&keys));

        services.for_each(Stage::PsmScoring, &keys, &|key| {
            let mut psm = services.store.spectrum(key)?;
            scorer.score_spectrum(&mut psm);
            services.store.update(key, Match::Spectrum(psm))
        })?;

        let mut map = ScoreMap::configured("psm", &self.config);
        for psm in services.spectra(&keys) {
            if psm.best.is_some() {
                map.add_point(psm.validation.score, psm.decoy(), psm.charge);
            }
        }
        map.estimate_probabilities();

        for engine in scorer.engines().values() {
            self.result.suspect(engine, self.config.target_psm_fdr);
        }
        self.result.engines = scorer.into_engines();
        self.result.psm_map = map;
        info!("Scored {} spectra", keys.len());
        Ok(())
    }

    fn validate_spectra(&mut self) -> Result<(), Error> {
        let services = self.services;
        let keys = services.store.keys(MatchKind::Spectrum);
        let map = &self.result.psm_map;
        let thresholder =
            ValidationThresholder::new(map, self.config.target_psm_fdr, self.config.confident_pep);

        services.for_each(Stage::PsmValidation, &keys, &|key| {
            let mut psm = services.store.spectrum(key)?;
            let (charge, decoy) = (psm.charge, psm.decoy());
            match psm.best.is_some() {
                true => thresholder.validate(&mut psm.validation, &charge, decoy),
                false => psm.validation.invalidate(),
            }
            services.store.update(key, Match::Spectrum(psm))
        })?;

        let summary = thresholder.summary();
        self.result.psm_summary = Some(summary);
        let map = self.result.psm_map.clone();
        self.result.suspect(&map, self.config.target_psm_fdr);
        Ok(())
    }

    /// Peptide records are derived from the retained assumptions of the
    /// PSMs. Records no PSM supports anymore are removed.
    fn score_peptides(&mut self) -> Result<(), Error> {
        let services = self.services;
        let store = services.store;

        let mut peptides: BTreeMap<MatchKey, PeptideMatch> = BTreeMap::new();
        for psm in services.spectra(&store.keys(MatchKind::Spectrum)) {
            let best = match &psm.best {
                Some(best) => best,
                None => continue,
            };
            let peptide = peptides
                .entry(best.peptide_key())
                .or_insert_with(|| PeptideMatch {
                    key: best.peptide_key(),
                    sequence: best.sequence.clone(),
                    modifications: best.modification_names(),
                    decoy: best.decoy,
                    spectra: Vec::new(),
                    proteins: Vec::new(),
                    protein_groups: Vec::new(),
                    inference: Default::default(),
                    sites: Vec::new(),
                    validation: Default::default(),
                });
            peptide.decoy |= best.decoy;
            peptide.spectra.push(psm.key.clone());
        }

        for key in store.keys(MatchKind::Peptide) {
            if !peptides.contains_key(&key) {
                store.remove(MatchKind::Peptide, &key);
            }
        }

        let keys = peptides.keys().cloned().collect::<Vec<_>>();
        let remap = self.remap;
        services.for_each(Stage::PeptideScoring, &keys, &|key| {
            let mut peptide = peptides[key].clone();
            if let Ok(old) = store.peptide(key) {
                peptide.validation.starred = old.validation.starred;
                peptide.validation.hidden = old.validation.hidden;
                peptide.protein_groups = old.protein_groups;
                peptide.inference = old.inference;
                if !remap {
                    peptide.proteins = old.proteins;
                }
            }
            let spectra = services.spectra(&peptide.spectra);
            peptide.validation.score = ProbabilisticScorer::peptide_score(key, &spectra);
            store.update(key, Match::Peptide(peptide))
        })?;

        let mut map = ScoreMap::configured("peptide", &self.config);
        for peptide in services.peptides(&keys) {
            map.add_point(
                peptide.validation.score,
                peptide.decoy,
                modification_profile(&peptide),
            );
        }
        map.estimate_probabilities();
        self.result.peptide_map = map;
        info!("Scored {} peptides", keys.len());
        Ok(())
    }

    fn validate_peptides(&mut self) -> Result<(), Error> {
        let services = self.services;
        let keys = services.store.keys(MatchKind::Peptide);
        let thresholder = ValidationThresholder::new(
            &self.result.peptide_map,
            self.config.target_peptide_fdr,
            self.config.confident_pep,
        );

        services.for_each(Stage::PeptideValidation, &keys, &|key| {
            let mut peptide = services.store.peptide(key)?;
            let (profile, decoy) = (modification_profile(&peptide), peptide.decoy);
            thresholder.validate(&mut peptide.validation, &profile, decoy);
            services.store.update(key, Match::Peptide(peptide))
        })?;

        let summary = thresholder.summary();
        self.result.peptide_summary = Some(summary);
        let map = self.result.peptide_map.clone();
        self.result.suspect(&map, self.config.target_peptide_fdr);
        Ok(())
    }

    /// Nothing is written to the store before the whole resolution
    /// succeeded
    fn group_proteins(&mut self) -> Result<(), Error> {
        let services = self.services;
        let store = services.store;

        let peptide_keys = store.keys(MatchKind::Peptide);
        let mut peptides = services.peptides(&peptide_keys);
        if self.remap {
            peptides.iter_mut().for_each(|p| p.proteins.clear());
        }

        let resolver =
            ProteinGroupResolver::new(services.cache, &self.config)?.with_progress(services.progress);
        let resolution = resolver.resolve(&peptides)?;
        drop(peptides);

        let live = resolution
            .groups
            .iter()
            .map(|group| (group.key.clone(), group))
            .collect::<BTreeMap<_, _>>();
        for key in store.keys(MatchKind::Protein) {
            if !live.contains_key(&key) {
                store.remove(MatchKind::Protein, &key);
            }
        }

        let group_keys = live.keys().cloned().collect::<Vec<_>>();
        services.for_each(Stage::ProteinGrouping, &group_keys, &|key| {
            let mut group = live[key].clone();
            if let Ok(old) = store.protein(key) {
                group.validation.starred = old.validation.starred;
                group.validation.hidden = old.validation.hidden;
            }
            store.update(key, Match::Protein(group))
        })?;

        services.for_each(Stage::ProteinGrouping, &peptide_keys, &|key| {
            let mut peptide = store.peptide(key)?;
            peptide.proteins = resolution
                .peptide_proteins
                .get(key)
                .cloned()
                .unwrap_or_default();
            peptide.protein_groups = resolution.peptide_groups.get(key).cloned().unwrap_or_default();
            store.update(key, Match::Peptide(peptide))
        })?;

        self.remap = false;
        self.result.resolution = Some(resolution.report);
        Ok(())
    }

    /// Only peptides mapping to a single protein group count as evidence
    fn score_proteins(&mut self) -> Result<(), Error> {
        let services = self.services;
        let store = services.store;
        let keys = store.keys(MatchKind::Protein);

        services.for_each(Stage::ProteinScoring, &keys, &|key| {
            let mut group = store.protein(key)?;
            let peps = services
                .peptides(&group.peptides)
                .into_iter()
                .filter(|peptide| peptide.protein_groups.len() == 1)
                .map(|peptide| peptide.validation.probability);
            group.validation.score = ProbabilisticScorer::protein_score(peps);
            store.update(key, Match::Protein(group))
        })?;

        let mut map = ScoreMap::configured("protein", &self.config);
        for group in store
            .iterate(MatchKind::Protein, &keys)
            .filter_map(Match::into_protein)
        {
            map.add_point(group.validation.score, group.decoy, ());
        }
        map.estimate_probabilities();
        self.result.protein_map = map;
        info!("Scored {} protein groups", keys.len());
        Ok(())
    }

    fn validate_proteins(&mut self) -> Result<(), Error> {
        let services = self.services;
        let keys = services.store.keys(MatchKind::Protein);
        let thresholder = ValidationThresholder::new(
            &self.result.protein_map,
            self.config.target_protein_fdr,
            self.config.confident_pep,
        );

        services.for_each(Stage::ProteinValidation, &keys, &|key| {
            let mut group = services.store.protein(key)?;
            let decoy = group.decoy;
            thresholder.validate(&mut group.validation, &(), decoy);
            services.store.update(key, Match::Protein(group))
        })?;

        let summary = thresholder.summary();
        self.result.protein_summary = Some(summary);
        let map = self.result.protein_map.clone();
        self.result.suspect(&map, self.config.target_protein_fdr);
        Ok(())
    }

    fn infer(&mut self) -> Result<(), Error> {
        let services = self.services;
        let store = services.store;
        let keys = store.keys(MatchKind::Protein);
        let groups = store
            .iterate(MatchKind::Protein, &keys)
            .filter_map(Match::into_protein)
            .collect::<Vec<_>>();
        let inference = infer(&groups, services.cache);
        drop(groups);

        services.for_each(Stage::Inference, &keys, &|key| {
            let mut group = store.protein(key)?;
            group.inference = inference.groups.get(key).copied().unwrap_or_default();
            store.update(key, Match::Protein(group))
        })?;

        let peptide_keys = store.keys(MatchKind::Peptide);
        services.for_each(Stage::Inference, &peptide_keys, &|key| {
            let mut peptide = store.peptide(key)?;
            peptide.inference = inference.peptides.get(key).copied().unwrap_or_default();
            store.update(key, Match::Peptide(peptide))
        })
    }

    /// Validated target PSMs are localized, the FLR cutoff is derived from
    /// all of them, and sites are then rolled up to peptides and proteins
    fn localize(&mut self) -> Result<(), Error> {
        let services = self.services;
        let store = services.store;
        let scorer = PTMLocalizationScorer::new(&self.config);

        let keys = store.keys(MatchKind::Spectrum);
        let found: DashMap<MatchKey, Localization, FnvBuildHasher> = DashMap::default();
        services.for_each(Stage::Localization, &keys, &|key| {
            let psm = store.spectrum(key)?;
            if psm.decoy() || !psm.validation.level.is_validated() {
                return Ok(());
            }
            if let Some(localization) = scorer.localize(&psm) {
                found.insert(key.clone(), localization);
            }
            Ok(())
        })?;

        let mut localized = found.into_iter().collect::<Vec<_>>();
        localized.sort_by(|a, b| a.0.cmp(&b.0));
        let flr = scorer.flr_map(localized.iter().map(|(_, l)| l));
        let cutoff = scorer.cutoff(&flr);
        info!(
            "Localized modifications on {} spectra, site probability cutoff {:?}",
            localized.len(),
            cutoff
        );

        services.for_each(Stage::Localization, &keys, &|key| {
            let mut psm = store.spectrum(key)?;
            psm.localization = localized
                .binary_search_by(|(k, _)| k.cmp(key))
                .ok()
                .map(|ix| {
                    let mut assignment = localized[ix].1.assignment.clone();
                    apply_cutoff(&mut assignment.sites, cutoff);
                    assignment
                });
            store.update(key, Match::Spectrum(psm))
        })?;

        let peptide_keys = store.keys(MatchKind::Peptide);
        services.for_each(Stage::Localization, &peptide_keys, &|key| {
            let mut peptide = store.peptide(key)?;
            let sites = services
                .spectra(&peptide.spectra)
                .into_iter()
                .filter(|psm| !psm.ambiguous)
                .filter(|psm| psm.best.as_ref().map(|b| &b.peptide_key() == key).unwrap_or(false))
                .filter_map(|psm| psm.localization)
                .flat_map(|assignment| assignment.sites);
            peptide.sites = aggregate(sites);
            store.update(key, Match::Peptide(peptide))
        })?;

        let matching = self.config.sequence_matching;
        let protein_keys = store.keys(MatchKind::Protein);
        services.for_each(Stage::Localization, &protein_keys, &|key| {
            let mut group = store.protein(key)?;
            let provider = services.cache.provider();
            let sites = services
                .peptides(&group.peptides)
                .into_iter()
                .filter(|peptide| !peptide.sites.is_empty())
                .flat_map(|peptide| {
                    let starts = provider.peptide_starts(&group.main, &peptide.sequence, matching);
                    to_protein(&peptide.sites, &starts)
                })
                .collect::<Vec<_>>();
            group.sites = aggregate(sites);
            store.update(key, Match::Protein(group))
        })?;

        self.result.flr_cutoff = cutoff;
        self.result.suspect(&flr, self.config.flr_threshold);
        self.result.flr_map = flr;
        Ok(())
    }
}
