use serde::{Deserialize, Serialize};

use crate::mass::{H2O, NEUTRON, PROTON};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    B,
    Y,
}

/// Theoretical B/Y ion
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ion {
    pub kind: Kind,
    /// Number of residues in the fragment
    pub size: usize,
    /// Neutral fragment mass (no charge)
    pub monoisotopic_mass: f64,
}

impl Ion {
    pub fn mz(&self, charge: u8) -> f64 {
        let charge = charge.max(1) as f64;
        (self.monoisotopic_mass + charge * PROTON) / charge
    }

    /// Residue indices covered by the fragment in a peptide of length `len`
    pub fn covers(&self, position: usize, len: usize) -> bool {
        match self.kind {
            Kind::B => position < self.size,
            Kind::Y => position >= len - self.size,
        }
    }
}

/// Generate B/Y ions for a peptide given as per-residue masses, modifications
/// included
pub struct IonSeries<'p> {
    pub kind: Kind,
    cumulative_mass: f64,
    residues: &'p [f64],
    idx: usize,
}

impl<'p> IonSeries<'p> {
    pub fn new(residues: &'p [f64], kind: Kind) -> Self {
        let cumulative_mass = match kind {
            Kind::B => 0.0,
            Kind::Y => residues.iter().sum::<f64>() + H2O,
        };
        Self {
            kind,
            cumulative_mass,
            residues,
            idx: 0,
        }
    }
}

impl<'p> Iterator for IonSeries<'p> {
    type Item = Ion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx + 1 >= self.residues.len() {
            return None;
        }
        let m = self.residues.get(self.idx)?;
        self.cumulative_mass += match self.kind {
            Kind::B => *m,
            Kind::Y => -*m,
        };
        self.idx += 1;

        Some(Ion {
            kind: self.kind,
            size: match self.kind {
                Kind::B => self.idx,
                Kind::Y => self.residues.len() - self.idx,
            },
            monoisotopic_mass: self.cumulative_mass,
        })
    }
}

/// Which fragments to consider when matching a spectrum
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FragmentSettings {
    pub max_charge: u8,
    pub neutral_losses: bool,
    pub min_isotope: i8,
    pub max_isotope: i8,
}

/// Theoretical fragment m/z values for a peptide. `losses` lists the
/// residues carrying a modification with a neutral loss, with the mass lost.
/// Fragments containing such a residue are also generated minus the loss.
pub fn fragment_mz(residues: &[f64], losses: &[(usize, f64)], settings: &FragmentSettings) -> Vec<f64> {
    let len = residues.len();
    let mut out = Vec::new();
    for kind in [Kind::B, Kind::Y] {
        for ion in IonSeries::new(residues, kind) {
            let mut masses = vec![ion.monoisotopic_mass];
            if settings.neutral_losses {
                let mut lost = losses
                    .iter()
                    .filter(|(pos, _)| ion.covers(*pos, len))
                    .map(|(_, loss)| *loss)
                    .collect::<Vec<_>>();
                lost.sort_by(|a, b| a.total_cmp(b));
                lost.dedup();
                masses.extend(lost.into_iter().map(|loss| ion.monoisotopic_mass - loss));
            }
            for mass in masses {
                for charge in 1..=settings.max_charge.max(1) {
                    for iso in settings.min_isotope..=settings.max_isotope {
                        let ion = Ion {
                            monoisotopic_mass: mass + iso as f64 * NEUTRON,
                            ..ion
                        };
                        out.push(ion.mz(charge));
                    }
                }
            }
        }
    }
    out.sort_by(|a, b| a.total_cmp(b));
    out
}
