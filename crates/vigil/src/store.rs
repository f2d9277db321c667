//! Key-value access to identification records.
//!
//! The engine treats the store as the single owner of match records: every
//! stage reads what it needs, and publishes each fully computed record
//! through [`MatchStore::update`] before the next stage starts.

use crate::ident::{Match, MatchKey, MatchKind, PeptideMatch, ProteinMatch, SpectrumMatch};
use crate::Error;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

pub trait MatchStore: Send + Sync {
    fn get(&self, kind: MatchKind, key: &MatchKey) -> Option<Match>;

    /// Publish a complete record. The record's own key must equal `key`.
    fn update(&self, key: &MatchKey, record: Match) -> Result<(), Error>;

    /// Lazily yield the records stored under `keys`, skipping missing ones
    fn iterate<'a>(
        &'a self,
        kind: MatchKind,
        keys: &'a [MatchKey],
    ) -> Box<dyn Iterator<Item = Match> + 'a>;

    fn remove(&self, kind: MatchKind, key: &MatchKey) -> Option<Match>;

    /// All keys of a given kind, sorted
    fn keys(&self, kind: MatchKind) -> Vec<MatchKey>;

    fn spectrum(&self, key: &MatchKey) -> Result<SpectrumMatch, Error> {
        self.get(MatchKind::Spectrum, key)
            .ok_or_else(|| Error::MissingMatch(key.clone()))?
            .into_spectrum()
            .ok_or_else(|| Error::UnexpectedMatch(key.clone()))
    }

    fn peptide(&self, key: &MatchKey) -> Result<PeptideMatch, Error> {
        self.get(MatchKind::Peptide, key)
            .ok_or_else(|| Error::MissingMatch(key.clone()))?
            .into_peptide()
            .ok_or_else(|| Error::UnexpectedMatch(key.clone()))
    }

    fn protein(&self, key: &MatchKey) -> Result<ProteinMatch, Error> {
        self.get(MatchKind::Protein, key)
            .ok_or_else(|| Error::MissingMatch(key.clone()))?
            .into_protein()
            .ok_or_else(|| Error::UnexpectedMatch(key.clone()))
    }
}

/// In-process store backed by a concurrent hash map
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<(MatchKind, MatchKey), Match, FnvBuildHasher>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Match) {
        self.records
            .insert((record.kind(), record.key().clone()), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<Match> for MemoryStore {
    fn from_iter<T: IntoIterator<Item = Match>>(iter: T) -> Self {
        let store = MemoryStore::default();
        for record in iter {
            store.insert(record);
        }
        store
    }
}

impl MatchStore for MemoryStore {
    fn get(&self, kind: MatchKind, key: &MatchKey) -> Option<Match> {
        self.records
            .get(&(kind, key.clone()))
            .map(|entry| entry.value().clone())
    }

    fn update(&self, key: &MatchKey, record: Match) -> Result<(), Error> {
        if record.key() != key {
            return Err(Error::UnexpectedMatch(key.clone()));
        }
        self.records.insert((record.kind(), key.clone()), record);
        Ok(())
    }

    fn iterate<'a>(
        &'a self,
        kind: MatchKind,
        keys: &'a [MatchKey],
    ) -> Box<dyn Iterator<Item = Match> + 'a> {
        Box::new(keys.iter().filter_map(move |key| self.get(kind, key)))
    }

    fn remove(&self, kind: MatchKind, key: &MatchKey) -> Option<Match> {
        self.records.remove(&(kind, key.clone())).map(|(_, v)| v)
    }

    fn keys(&self, kind: MatchKind) -> Vec<MatchKey> {
        let mut keys = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ident::{PeptideMatch, Validation};

    fn peptide(key: &str) -> Match {
        Match::Peptide(PeptideMatch {
            key: key.into(),
            sequence: key.into(),
            modifications: vec![],
            decoy: false,
            spectra: vec![],
            proteins: vec![],
            protein_groups: vec![],
            inference: Default::default(),
            sites: vec![],
            validation: Validation::default(),
        })
    }

    #[test]
    fn update_requires_matching_key() {
        let store = MemoryStore::new();
        assert!(store.update(&"AAA".into(), peptide("BBB")).is_err());
        assert!(store.update(&"AAA".into(), peptide("AAA")).is_ok());
        assert_eq!(store.keys(MatchKind::Peptide), vec![MatchKey::from("AAA")]);
        assert!(store.keys(MatchKind::Protein).is_empty());
    }

    #[test]
    fn typed_access() {
        let store: MemoryStore = vec![peptide("AAA"), peptide("CCC")].into_iter().collect();
        assert!(store.peptide(&"AAA".into()).is_ok());
        assert!(matches!(
            store.spectrum(&"AAA".into()),
            Err(Error::MissingMatch(_))
        ));
        let keys = vec![MatchKey::from("CCC"), MatchKey::from("ZZZ")];
        assert_eq!(store.iterate(MatchKind::Peptide, &keys).count(), 1);
        assert!(store.remove(MatchKind::Peptide, &"AAA".into()).is_some());
        assert_eq!(store.len(), 1);
    }
}
