use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{CompoundName, InputCompound};
use crate::error::DockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTable<T> {
    rows: BTreeMap<CompoundName, T>,
}

impl<T> Default for NamedTable<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T> NamedTable<T> {
    pub fn from_rows<I>(rows: I) -> Result<Self, DockError>
    where
        I: IntoIterator<Item = (CompoundName, T)>,
    {
        let mut table = BTreeMap::new();
        for (name, value) in rows {
            if table.contains_key(&name) {
                return Err(DockError::DuplicateIdentity(name.to_string()));
            }
            table.insert(name, value);
        }
        Ok(Self { rows: table })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, name: &CompoundName) -> Option<&T> {
        self.rows.get(name)
    }

    pub fn contains(&self, name: &CompoundName) -> bool {
        self.rows.contains_key(name)
    }

    pub fn names(&self) -> Vec<CompoundName> {
        self.rows.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CompoundName, &T)> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> impl Iterator<Item = (CompoundName, T)> {
        self.rows.into_iter()
    }

    pub fn join<U: Clone>(&self, other: &NamedTable<U>, how: JoinKind) -> NamedTable<(T, Option<U>)>
    where
        T: Clone,
    {
        let rows = self
            .rows
            .iter()
            .filter_map(|(name, left)| {
                let right = other.rows.get(name).cloned();
                match (how, right) {
                    (JoinKind::Inner, None) => None,
                    (_, right) => Some((name.clone(), (left.clone(), right))),
                }
            })
            .collect();
        NamedTable { rows }
    }

    pub fn filter<F>(&self, mut keep: F) -> NamedTable<T>
    where
        T: Clone,
        F: FnMut(&CompoundName, &T) -> bool,
    {
        NamedTable {
            rows: self
                .rows
                .iter()
                .filter(|(name, value)| keep(name, value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

pub fn excluded_count<T, U>(before: &NamedTable<T>, after: &NamedTable<U>) -> usize {
    before.len().saturating_sub(after.len())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Exclusion {
    Salt,
    TooLarge,
    StructureFailed(String),
    ConversionFailed(String),
    IdentityMismatch,
    DockingFailed(String),
    ScoreMalformed(String),
    BelowThreshold,
}

impl Exclusion {
    pub fn label(&self) -> &'static str {
        match self {
            Exclusion::Salt => "salt",
            Exclusion::TooLarge => "too_large",
            Exclusion::StructureFailed(_) => "structure_failed",
            Exclusion::ConversionFailed(_) => "conversion_failed",
            Exclusion::IdentityMismatch => "identity_mismatch",
            Exclusion::DockingFailed(_) => "docking_failed",
            Exclusion::ScoreMalformed(_) => "score_malformed",
            Exclusion::BelowThreshold => "below_threshold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompoundRecord {
    pub smiles: String,
    pub salt_free: Option<bool>,
    pub heavy_atoms: Option<u32>,
    pub size_ok: Option<bool>,
    pub similarity: Option<f64>,
    pub identity_verified: Option<bool>,
    pub affinity: Option<f64>,
    pub efficiency: Option<f64>,
    pub validity_passes: Option<u32>,
    pub excluded: Option<Exclusion>,
}

impl CompoundRecord {
    pub fn is_active(&self) -> bool {
        self.excluded.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    records: NamedTable<CompoundRecord>,
}

impl IdentityRegistry {
    pub fn seed(compounds: &[InputCompound]) -> Result<Self, DockError> {
        let records = NamedTable::from_rows(compounds.iter().map(|compound| {
            (
                compound.name.clone(),
                CompoundRecord {
                    smiles: compound.smiles.clone(),
                    ..CompoundRecord::default()
                },
            )
        }))?;
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &CompoundName) -> Option<&CompoundRecord> {
        self.records.get(name)
    }

    pub fn records(&self) -> &NamedTable<CompoundRecord> {
        &self.records
    }

    pub fn active(&self) -> Vec<CompoundName> {
        self.records
            .iter()
            .filter(|(_, record)| record.is_active())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn active_smiles(&self) -> NamedTable<String> {
        NamedTable {
            rows: self
                .records
                .iter()
                .filter(|(_, record)| record.is_active())
                .map(|(name, record)| (name.clone(), record.smiles.clone()))
                .collect(),
        }
    }

    /// Left-joins `attributes` onto the registry, applying `apply` to every
    /// matched record. Unmatched records are left untouched.
    pub fn accrete<U, F>(&mut self, attributes: &NamedTable<U>, mut apply: F) -> usize
    where
        F: FnMut(&mut CompoundRecord, &U),
    {
        let mut matched = 0;
        for (name, record) in self.records.rows.iter_mut() {
            if let Some(value) = attributes.get(name) {
                apply(record, value);
                matched += 1;
            }
        }
        matched
    }

    pub fn exclude(&mut self, name: &CompoundName, reason: Exclusion) {
        if let Some(record) = self.records.rows.get_mut(name) {
            if record.excluded.is_none() {
                record.excluded = Some(reason);
            }
        }
    }

    pub fn retain_active<F>(&mut self, survivors: &[CompoundName], mut reason: F) -> usize
    where
        F: FnMut(&CompoundName) -> Exclusion,
    {
        let mut dropped = 0;
        for (name, record) in self.records.rows.iter_mut() {
            if record.is_active() && survivors.binary_search(name).is_err() {
                record.excluded = Some(reason(name));
                dropped += 1;
            }
        }
        dropped
    }

    pub fn to_snapshot(&self) -> Vec<RegistryRow> {
        self.records
            .iter()
            .map(|(name, record)| RegistryRow {
                name: name.clone(),
                record: record.clone(),
            })
            .collect()
    }

    pub fn from_snapshot(rows: Vec<RegistryRow>) -> Result<Self, DockError> {
        let records = NamedTable::from_rows(rows.into_iter().map(|row| (row.name, row.record)))?;
        Ok(Self { records })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRow {
    pub name: CompoundName,
    #[serde(flatten)]
    pub record: CompoundRecord,
}
