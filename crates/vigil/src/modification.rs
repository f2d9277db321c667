use std::{
    fmt::{Display, Write},
    str::FromStr,
};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::mass::VALID_AA;

/// Where a variable modification may be placed
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModificationSpecificity {
    PeptideN(Option<u8>),
    PeptideC(Option<u8>),
    Residue(u8),
}

impl ModificationSpecificity {
    /// Can a modification with this specificity sit on residue `position`
    /// of `sequence`?
    pub fn matches(&self, sequence: &[u8], position: usize) -> bool {
        let residue = match sequence.get(position) {
            Some(r) => *r,
            None => return false,
        };
        match self {
            ModificationSpecificity::Residue(r) => *r == residue,
            ModificationSpecificity::PeptideN(r) => {
                position == 0 && r.map(|r| r == residue).unwrap_or(true)
            }
            ModificationSpecificity::PeptideC(r) => {
                position + 1 == sequence.len() && r.map(|r| r == residue).unwrap_or(true)
            }
        }
    }
}

impl Display for ModificationSpecificity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = match self {
            ModificationSpecificity::PeptideN(r) => {
                f.write_char('^')?;
                *r
            }
            ModificationSpecificity::PeptideC(r) => {
                f.write_char('$')?;
                *r
            }
            ModificationSpecificity::Residue(r) => Some(*r),
        };

        if let Some(r) = r {
            f.write_char(r as char)?;
        }

        Ok(())
    }
}

impl Serialize for ModificationSpecificity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModificationSpecificity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: InvalidModification| D::Error::custom(e))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvalidModification {
    Empty,
    InvalidResidue(char),
    TooLong(String),
}

impl Display for InvalidModification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidModification::Empty => write!(f, "invalid modification string: empty"),
            InvalidModification::InvalidResidue(c) => {
                write!(f, "invalid modification string: unrecognized residue ({})", c)
            }
            InvalidModification::TooLong(s) => {
                write!(f, "invalid modification string: {} is too long", s)
            }
        }
    }
}

impl FromStr for ModificationSpecificity {
    type Err = InvalidModification;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > 2 {
            return Err(InvalidModification::TooLong(s.into()));
        }
        let residue = |rest: &str| match rest.chars().next() {
            Some(c) if VALID_AA.contains(&(c as u8)) => Ok(Some(c as u8)),
            Some(c) => Err(InvalidModification::InvalidResidue(c)),
            None => Ok(None),
        };
        if let Some(rest) = s.strip_prefix('^') {
            return Ok(ModificationSpecificity::PeptideN(residue(rest)?));
        }
        if let Some(rest) = s.strip_prefix('$') {
            return Ok(ModificationSpecificity::PeptideC(residue(rest)?));
        }
        match residue(s)? {
            Some(r) => Ok(ModificationSpecificity::Residue(r)),
            None => Err(InvalidModification::Empty),
        }
    }
}

/// Definition of a variable modification whose site may be localized
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableModification {
    pub name: String,
    /// Monoisotopic mass shift
    pub mass: f64,
    pub specificities: Vec<ModificationSpecificity>,
    /// Mass lost by fragments carrying the modification, e.g. H3PO4
    #[serde(default)]
    pub neutral_loss: Option<f64>,
}

impl VariableModification {
    pub fn phosphorylation() -> Self {
        Self {
            name: "Phospho".into(),
            mass: 79.966331,
            specificities: vec![
                ModificationSpecificity::Residue(b'S'),
                ModificationSpecificity::Residue(b'T'),
                ModificationSpecificity::Residue(b'Y'),
            ],
            neutral_loss: Some(97.976896),
        }
    }

    pub fn can_modify(&self, sequence: &[u8], position: usize) -> bool {
        self.specificities
            .iter()
            .any(|spec| spec.matches(sequence, position))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_modifications() {
        use InvalidModification::*;
        use ModificationSpecificity::*;
        assert_eq!("^".parse::<ModificationSpecificity>(), Ok(PeptideN(None)));
        assert_eq!("^Q".parse::<ModificationSpecificity>(), Ok(PeptideN(Some(b'Q'))));
        assert_eq!("$K".parse::<ModificationSpecificity>(), Ok(PeptideC(Some(b'K'))));
        assert_eq!("S".parse::<ModificationSpecificity>(), Ok(Residue(b'S')));
        assert_eq!("Z".parse::<ModificationSpecificity>(), Err(InvalidResidue('Z')));
        assert_eq!("".parse::<ModificationSpecificity>(), Err(Empty));
        assert_eq!("STY".parse::<ModificationSpecificity>(), Err(TooLong("STY".into())));
    }

    #[test]
    fn specificity_positions() {
        let seq = b"QSTK";
        let phospho = VariableModification::phosphorylation();
        let sites = (0..seq.len())
            .filter(|&ix| phospho.can_modify(seq, ix))
            .collect::<Vec<_>>();
        assert_eq!(sites, vec![1, 2]);
        assert!(ModificationSpecificity::PeptideN(Some(b'Q')).matches(seq, 0));
        assert!(!ModificationSpecificity::PeptideN(None).matches(seq, 1));
        assert!(ModificationSpecificity::PeptideC(None).matches(seq, 3));
    }

    #[test]
    fn deserialize_definition() {
        let m: VariableModification = serde_json::from_str(
            r#"{"name": "Acetyl", "mass": 42.010565, "specificities": ["^", "K"]}"#,
        )
        .unwrap();
        assert_eq!(m.specificities.len(), 2);
        assert!(m.neutral_loss.is_none());
    }
}
