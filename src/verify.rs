use std::collections::BTreeMap;

use tracing::info;

use crate::chem::SimilarityScorer;
use crate::domain::CompoundName;
use crate::error::DockError;
use crate::registry::{JoinKind, NamedTable, excluded_count};
use crate::runner::{ItemOutcome, TaskRunner};

pub const EXACT_MATCH: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub verified: Vec<CompoundName>,
    pub scores: BTreeMap<CompoundName, Option<f64>>,
    pub unmatched: Vec<CompoundName>,
}

impl Verification {
    pub fn rejected(&self) -> impl Iterator<Item = (&CompoundName, Option<f64>)> {
        self.scores
            .iter()
            .filter(|(_, score)| !is_exact(**score))
            .map(|(name, score)| (name, *score))
    }
}

pub fn is_exact(score: Option<f64>) -> bool {
    score == Some(EXACT_MATCH)
}

pub fn verify_identity<S: SimilarityScorer + ?Sized>(
    declared: &NamedTable<String>,
    recovered: &NamedTable<String>,
    scorer: &S,
    runner: &TaskRunner,
) -> Result<Verification, DockError> {
    let joined = declared.join(recovered, JoinKind::Inner);
    let unmatched = declared
        .names()
        .into_iter()
        .filter(|name| !joined.contains(name))
        .collect();

    let pairs: Vec<(CompoundName, (String, String))> = joined
        .into_rows()
        .filter_map(|(name, (left, right))| right.map(|right| (name, (left, right))))
        .collect();
    let report = runner.run("verify identity", &pairs, |_, (left, right)| {
        ItemOutcome::Ok(scorer.similarity(left, right))
    })?;

    let mut scores: BTreeMap<CompoundName, Option<f64>> = report.succeeded;
    for name in report.failed.into_keys() {
        scores.insert(name, None);
    }
    let verified: Vec<CompoundName> = scores
        .iter()
        .filter(|(_, score)| is_exact(**score))
        .map(|(name, _)| name.clone())
        .collect();

    let verified_table = declared.filter(|name, _| verified.binary_search(name).is_ok());
    info!(
        verified = verified.len(),
        dropped = excluded_count(declared, &verified_table),
        "identity verification finished"
    );
    Ok(Verification {
        verified,
        scores,
        unmatched,
    })
}
