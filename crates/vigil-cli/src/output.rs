use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;
use vigil_core::ident::{
    Match, MatchKind, PeptideMatch, ProteinMatch, SiteProbability, SpectrumMatch, Validation,
};
use vigil_core::store::MatchStore;

use crate::Runner;

/// Name of a unit enum variant, as it is serialized
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// `name@position:probability` entries, positions shifted by `offset`.
/// Confident sites are flagged with a trailing `*`
fn sites(sites: &[SiteProbability], offset: usize) -> String {
    sites
        .iter()
        .map(|site| {
            format!(
                "{}@{}:{:.4}{}",
                site.modification,
                site.position + offset,
                site.probability,
                if site.confident { "*" } else { "" }
            )
        })
        .join(";")
}

fn push_validation(record: &mut csv::ByteRecord, validation: &Validation) {
    record.push_field(ryu::Buffer::new().format(validation.score).as_bytes());
    record.push_field(ryu::Buffer::new().format(validation.probability).as_bytes());
    record.push_field(ryu::Buffer::new().format(validation.confidence).as_bytes());
    record.push_field(label(&validation.level).as_bytes());
    record.push_field(itoa::Buffer::new().format(validation.starred as u8).as_bytes());
    record.push_field(itoa::Buffer::new().format(validation.hidden as u8).as_bytes());
}

const VALIDATION_HEADERS: [&str; 6] = [
    "score",
    "posterior_error",
    "confidence",
    "validation",
    "starred",
    "hidden",
];

impl Runner {
    pub fn serialize_psm(&self, psm: &SpectrumMatch) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(psm.key.0.as_bytes());
        record.push_field(psm.file.as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.charge).as_bytes());
        match &psm.best {
            Some(best) => {
                record.push_field(best.sequence.as_bytes());
                let modifications = best
                    .modifications
                    .iter()
                    .sorted()
                    .map(|m| format!("{}@{}", m.name, m.position + 1))
                    .join(";");
                record.push_field(modifications.as_bytes());
            }
            None => {
                record.push_field(b"");
                record.push_field(b"");
            }
        }
        let engines = psm.assumptions.iter().map(|a| a.engine.as_str()).sorted().dedup().join(";");
        record.push_field(engines.as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.decoy() as u8).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.ambiguous as u8).as_bytes());
        push_validation(&mut record, &psm.validation);
        match &psm.localization {
            Some(localization) => {
                record.push_field(sites(&localization.sites, 1).as_bytes());
                match localization.ascore {
                    Some(ascore) => record.push_field(ryu::Buffer::new().format(ascore).as_bytes()),
                    None => record.push_field(b""),
                }
            }
            None => {
                record.push_field(b"");
                record.push_field(b"");
            }
        }
        record
    }

    pub fn serialize_peptide(&self, peptide: &PeptideMatch) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(peptide.key.0.as_bytes());
        record.push_field(peptide.sequence.as_bytes());
        record.push_field(peptide.modifications.join(";").as_bytes());
        record.push_field(peptide.proteins.join(";").as_bytes());
        record.push_field(peptide.protein_groups.iter().join(";").as_bytes());
        record.push_field(itoa::Buffer::new().format(peptide.decoy as u8).as_bytes());
        record.push_field(itoa::Buffer::new().format(peptide.spectra.len()).as_bytes());
        record.push_field(label(&peptide.inference).as_bytes());
        push_validation(&mut record, &peptide.validation);
        record.push_field(sites(&peptide.sites, 1).as_bytes());
        record
    }

    pub fn serialize_protein(&self, protein: &ProteinMatch) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(protein.key.0.as_bytes());
        record.push_field(protein.main.as_bytes());
        record.push_field(protein.accessions.join(";").as_bytes());
        record.push_field(itoa::Buffer::new().format(protein.accessions.len()).as_bytes());
        let description = self
            .cache
            .protein(&protein.main)
            .map(|info| info.description.clone())
            .unwrap_or_default();
        record.push_field(description.as_bytes());
        record.push_field(itoa::Buffer::new().format(protein.peptides.len()).as_bytes());
        record.push_field(itoa::Buffer::new().format(protein.decoy as u8).as_bytes());
        record.push_field(label(&protein.state).as_bytes());
        record.push_field(label(&protein.inference).as_bytes());
        record.push_field(protein.merge_reasons.iter().map(label).join(";").as_bytes());
        push_validation(&mut record, &protein.validation);
        // protein sites are already 1-based
        record.push_field(sites(&protein.sites, 0).as_bytes());
        record
    }

    fn write_table(
        &self,
        file_name: &str,
        headers: Vec<&str>,
        records: Vec<csv::ByteRecord>,
    ) -> anyhow::Result<String> {
        let path = self.make_path(file_name);

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        wtr.write_byte_record(&csv::ByteRecord::from(headers))?;
        for record in records {
            wtr.write_byte_record(&record)?;
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }

    fn records(&self, kind: MatchKind) -> Vec<Match> {
        let keys = self.store.keys(kind);
        self.store.iterate(kind, &keys).collect()
    }

    pub fn write_psms(&self) -> anyhow::Result<String> {
        let mut headers = vec![
            "psm",
            "filename",
            "charge",
            "peptide",
            "modifications",
            "engines",
            "decoy",
            "ambiguous",
        ];
        headers.extend(VALIDATION_HEADERS);
        headers.extend(["sites", "ascore"]);

        let records = self
            .records(MatchKind::Spectrum)
            .into_par_iter()
            .filter_map(Match::into_spectrum)
            .map(|psm| self.serialize_psm(&psm))
            .collect::<Vec<_>>();
        self.write_table("psms.tsv", headers, records)
    }

    pub fn write_peptides(&self) -> anyhow::Result<String> {
        let mut headers = vec![
            "peptide",
            "sequence",
            "modifications",
            "proteins",
            "protein_groups",
            "decoy",
            "spectra",
            "inference",
        ];
        headers.extend(VALIDATION_HEADERS);
        headers.push("sites");

        let records = self
            .records(MatchKind::Peptide)
            .into_par_iter()
            .filter_map(Match::into_peptide)
            .map(|peptide| self.serialize_peptide(&peptide))
            .collect::<Vec<_>>();
        self.write_table("peptides.tsv", headers, records)
    }

    pub fn write_proteins(&self) -> anyhow::Result<String> {
        let mut headers = vec![
            "protein_group",
            "main_accession",
            "accessions",
            "num_proteins",
            "description",
            "peptides",
            "decoy",
            "state",
            "inference",
            "merge_reasons",
        ];
        headers.extend(VALIDATION_HEADERS);
        headers.push("sites");

        let records = self
            .records(MatchKind::Protein)
            .into_par_iter()
            .filter_map(Match::into_protein)
            .map(|protein| self.serialize_protein(&protein))
            .collect::<Vec<_>>();
        self.write_table("proteins.tsv", headers, records)
    }
}
