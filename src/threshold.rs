use std::collections::BTreeMap;

use tracing::info;

use crate::domain::{CompoundName, StageId, ThresholdSpec};
use crate::error::DockError;
use crate::store::{Overwrite, StageManifest, Store};
use crate::tables;

pub const SELECTION_FILE: &str = "selection.csv";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cutoff {
    Below(f64),
    Between(f64, f64),
    Undefined,
}

impl Cutoff {
    pub fn resolve(scores: &[f64], spec: &ThresholdSpec) -> Cutoff {
        match *spec {
            ThresholdSpec::Static { value } => Cutoff::Below(value),
            ThresholdSpec::Dynamic { factor } => match mean_and_std(scores) {
                Some((mean, std)) => Cutoff::Below(mean - factor * std),
                None => Cutoff::Undefined,
            },
            ThresholdSpec::Range { low, high } => Cutoff::Between(low, high),
        }
    }

    pub fn accepts(&self, score: f64) -> bool {
        match *self {
            Cutoff::Below(limit) => score < limit,
            Cutoff::Between(low, high) => low <= score && score <= high,
            Cutoff::Undefined => false,
        }
    }
}

pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;
    Some((mean, variance.sqrt()))
}

pub fn select(
    scored: &[(CompoundName, f64)],
    spec: &ThresholdSpec,
) -> Result<Vec<(CompoundName, f64)>, DockError> {
    spec.validate()?;
    let scores: Vec<f64> = scored.iter().map(|(_, score)| *score).collect();
    let cutoff = Cutoff::resolve(&scores, spec);
    let mut subset: Vec<(CompoundName, f64)> = scored
        .iter()
        .filter(|(_, score)| cutoff.accepts(*score))
        .cloned()
        .collect();
    subset.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(subset)
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub selected: Vec<(CompoundName, f64)>,
    pub manifest: StageManifest,
}

/// A selected compound without a `source` artifact is recorded as a failed
/// item of the new stage.
pub fn extract(
    store: &Store,
    source: StageId,
    target: StageId,
    scored: &[(CompoundName, f64)],
    spec: &ThresholdSpec,
    overwrite: Overwrite,
) -> Result<Extraction, DockError> {
    let selected = select(scored, spec)?;
    let writer = store.create_stage(target, overwrite)?;
    let available = store.list_artifacts(source)?;

    let mut failed = BTreeMap::new();
    for (name, _) in &selected {
        if available.binary_search(name).is_ok() {
            store.copy_artifact(source, &writer, name)?;
        } else {
            failed.insert(
                name.clone(),
                format!("no {} artifact to extract", source.dir_name()),
            );
        }
    }
    writer.write_side_file(SELECTION_FILE, &tables::write_scores(&selected)?)?;

    let expected: Vec<CompoundName> = selected.iter().map(|(name, _)| name.clone()).collect();
    let manifest = writer.commit(&expected, failed)?;
    info!(
        stage = %target,
        scored = scored.len(),
        selected = selected.len(),
        "threshold extraction committed"
    );
    Ok(Extraction { selected, manifest })
}

pub fn read_selection(store: &Store, stage: StageId) -> Result<Vec<(CompoundName, f64)>, DockError> {
    tables::read_scores(&store.read_stage_file(stage, SELECTION_FILE)?)
}
