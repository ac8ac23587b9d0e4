use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DockError;

/// Names double as artifact file stems, so anything that could escape a
/// stage directory is rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompoundName(String);

impl CompoundName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn generated(index: usize) -> Self {
        Self(format!("agan{}", index + 1))
    }
}

impl fmt::Display for CompoundName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompoundName {
    type Err = DockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && !trimmed.starts_with('.')
            && !trimmed
                .chars()
                .any(|ch| ch == '/' || ch == '\\' || ch.is_control());
        if !is_valid {
            return Err(DockError::InvalidCompoundName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for CompoundName {
    type Error = DockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompoundName> for String {
    fn from(value: CompoundName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputCompound {
    pub name: CompoundName,
    pub smiles: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Structures,
    Mol2,
    Mol2Renumbered,
    Pdbqt,
    RoundTrip,
    DockingInput,
    Batches,
    Docked,
    Scores,
    Candidates,
    FirstPose,
    DockedSdf,
    Complexes,
    ValidityInput,
    Validity,
    Interactions,
}

impl StageId {
    pub const ALL: [StageId; 16] = [
        StageId::Structures,
        StageId::Mol2,
        StageId::Mol2Renumbered,
        StageId::Pdbqt,
        StageId::RoundTrip,
        StageId::DockingInput,
        StageId::Batches,
        StageId::Docked,
        StageId::Scores,
        StageId::Candidates,
        StageId::FirstPose,
        StageId::DockedSdf,
        StageId::Complexes,
        StageId::ValidityInput,
        StageId::Validity,
        StageId::Interactions,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            StageId::Structures => "01_sdf",
            StageId::Mol2 => "02_mol2",
            StageId::Mol2Renumbered => "03_mol2_renumbered",
            StageId::Pdbqt => "04_pdbqt",
            StageId::RoundTrip => "05_smiles",
            StageId::DockingInput => "06_pdbqt_for_docking",
            StageId::Batches => "07_batches",
            StageId::Docked => "08_pdbqt_out",
            StageId::Scores => "09_scores",
            StageId::Candidates => "10_pdbqt_out_threshold",
            StageId::FirstPose => "11_pdbqt_out_m1",
            StageId::DockedSdf => "12_sdf_out",
            StageId::Complexes => "13_complexes",
            StageId::ValidityInput => "14_sdf_out_range",
            StageId::Validity => "15_validity",
            StageId::Interactions => "16_interactions",
        }
    }

    pub fn artifact_suffix(self) -> &'static str {
        match self {
            StageId::Structures => ".sdf",
            StageId::Mol2 | StageId::Mol2Renumbered => ".mol2",
            StageId::Pdbqt | StageId::DockingInput => ".pdbqt",
            StageId::RoundTrip => ".smi",
            StageId::Batches => ".txt",
            StageId::Docked | StageId::Candidates | StageId::FirstPose => "_out.pdbqt",
            StageId::DockedSdf | StageId::ValidityInput => "_out.sdf",
            StageId::Complexes => ".pdb",
            StageId::Scores | StageId::Validity => ".csv",
            StageId::Interactions => ".xml",
        }
    }

    pub fn is_rerunnable(self) -> bool {
        matches!(
            self,
            StageId::ValidityInput | StageId::Validity | StageId::Interactions
        )
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ThresholdSpec {
    Static { value: f64 },
    Dynamic { factor: f64 },
    Range { low: f64, high: f64 },
}

impl ThresholdSpec {
    pub fn validate(&self) -> Result<(), DockError> {
        match *self {
            ThresholdSpec::Static { value } if !value.is_finite() => Err(
                DockError::InvalidThreshold(format!("static value {value} is not finite")),
            ),
            ThresholdSpec::Dynamic { factor } if !factor.is_finite() => Err(
                DockError::InvalidThreshold(format!("factor {factor} is not finite")),
            ),
            ThresholdSpec::Range { low, high } if !(low.is_finite() && high.is_finite()) => Err(
                DockError::InvalidThreshold(format!("range {low}..={high} is not finite")),
            ),
            ThresholdSpec::Range { low, high } if low > high => Err(DockError::InvalidThreshold(
                format!("lower bound {low} exceeds upper bound {high}"),
            )),
            _ => Ok(()),
        }
    }
}
