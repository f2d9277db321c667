//! Full validation run over a small phosphoproteomics dataset: four target
//! proteins with reversed decoys, two search engines, and a phosphopeptide
//! whose engine-reported site is sometimes wrong.

use std::sync::Arc;
use vigil_core::cache::SequenceCache;
use vigil_core::config::{ScoringConfig, ScoringOptions};
use vigil_core::executor::ThreadPoolExecutor;
use vigil_core::ident::{
    GroupState, Match, MatchKey, MatchKind, ProteinInferenceClass, SpectrumMatch, ValidationLevel,
};
use vigil_core::pipeline::{RunStatus, Services, ValidationPipeline};
use vigil_core::progress::LogProgress;
use vigil_core::store::{MatchStore, MemoryStore};

fn config() -> ScoringConfig {
    let options: ScoringOptions = vigil_core::read_json("../../tests/data/params.json").unwrap();
    options.build().unwrap()
}

fn store() -> MemoryStore {
    let spectra: Vec<SpectrumMatch> =
        vigil_core::read_json("../../tests/data/identifications.json").unwrap();
    spectra.into_iter().map(Match::Spectrum).collect()
}

fn cache(config: &ScoringConfig) -> SequenceCache {
    let fasta = vigil_core::read_fasta("../../tests/data/vigil.fasta", &config.decoy_tag).unwrap();
    SequenceCache::new(Arc::new(fasta))
}

#[test]
fn validate_dataset() {
    let config = config();
    let store = store();
    let cache = cache(&config);
    let progress = LogProgress::default();
    let executor = ThreadPoolExecutor::new(2).unwrap();
    let services = Services {
        store: &store,
        cache: &cache,
        progress: &progress,
        executor: &executor,
        memory: None,
    };

    let mut pipeline = ValidationPipeline::new(config, services);
    let result = pipeline.run().unwrap().clone();
    assert_eq!(result.status, RunStatus::Complete);
    assert_eq!(result.engines.len(), 2);
    assert!(result.psm_summary.as_ref().unwrap().validated > 0);

    // decoys are never validated
    for kind in [MatchKind::Spectrum, MatchKind::Peptide, MatchKind::Protein] {
        let keys = store.keys(kind);
        for record in store.iterate(kind, &keys) {
            if record.decoy() {
                assert!(!record.validation().level.is_validated(), "{}", record.key());
            }
            let v = record.validation();
            assert!((v.confidence - 100.0 * (1.0 - v.probability)).abs() < 1e-9 || v.level == ValidationLevel::None);
        }
    }

    // the keratins share a peptide and tie on every criterion: the shared
    // group is kept
    let shared = store
        .protein(&"sp|P04264|K2C1_HUMAN/sp|P35908|K22E_HUMAN".into())
        .unwrap();
    assert_eq!(shared.state, GroupState::ResolvedAmbiguous);
    assert_eq!(shared.inference, ProteinInferenceClass::Related);
    let report = result.resolution.as_ref().unwrap();
    assert!(report.ties >= 1);

    let krt1 = store.protein(&"sp|P04264|K2C1_HUMAN".into()).unwrap();
    let krt2 = store.protein(&"sp|P35908|K22E_HUMAN".into()).unwrap();
    let peptide = MatchKey::from("SLHTLFGDELCK");
    assert!(shared.peptides.contains(&peptide));
    assert!(!krt1.peptides.contains(&peptide));
    assert!(!krt2.peptides.contains(&peptide));
    let shared_peptide = store.peptide(&peptide).unwrap();
    assert_eq!(shared_peptide.protein_groups, vec![shared.key.clone()]);
    assert_eq!(shared_peptide.inference, ProteinInferenceClass::Related);
    // the shared peptide counts towards the shared group alone
    assert_eq!(
        shared.validation.score > 0.0,
        shared_peptide.validation.probability < 1.0
    );

    // only groups that could not be reduced contain another live group
    let keys = store.keys(MatchKind::Protein);
    let groups = store
        .iterate(MatchKind::Protein, &keys)
        .filter_map(Match::into_protein)
        .collect::<Vec<_>>();
    for a in &groups {
        assert_ne!(a.state, GroupState::Deleted);
        for b in &groups {
            let contained = a.accessions.len() < b.accessions.len()
                && a.accessions.iter().all(|acc| b.accessions.contains(acc));
            assert!(
                !contained || b.state == GroupState::ResolvedAmbiguous,
                "{} is contained in {}",
                a.key,
                b.key
            );
        }
    }

    // every peptide keeps at least one group
    let keys = store.keys(MatchKind::Peptide);
    for peptide in store.iterate(MatchKind::Peptide, &keys).filter_map(Match::into_peptide) {
        assert!(!peptide.protein_groups.is_empty(), "{}", peptide.key);
    }

    // the phosphate sits on S3 of GASPTLK, residue 15 of the protein
    let phospho = store.peptide(&"GASPTLK[Phospho]".into()).unwrap();
    assert_eq!(phospho.sites[0].position, 2);
    assert!(phospho.sites[0].probability > 0.9);
    let protein = store.protein(&"sp|Q8N3Y7|KSUB_HUMAN".into()).unwrap();
    assert!(protein.sites.iter().any(|s| s.position == 15 && s.modification == "Phospho"));
}

#[test]
fn stricter_fdr_validates_fewer_spectra() {
    let config = config();
    let store = store();
    let cache = cache(&config);
    let progress = LogProgress::default();
    let executor = ThreadPoolExecutor::new(2).unwrap();
    let services = Services {
        store: &store,
        cache: &cache,
        progress: &progress,
        executor: &executor,
        memory: None,
    };

    let loose = ScoringConfig {
        target_psm_fdr: 10.0,
        ..config.clone()
    };
    let mut pipeline = ValidationPipeline::new(loose, services);
    let before = pipeline.run().unwrap().psm_summary.clone().unwrap();
    let after = pipeline.revalidate(config).unwrap().psm_summary.clone().unwrap();
    assert!(after.validated <= before.validated);
    assert_eq!(pipeline.result().status, RunStatus::Complete);
}
