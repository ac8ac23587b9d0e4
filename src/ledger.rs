use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::StageId;
use crate::error::DockError;
use crate::store::{StageManifest, Store, read_json, write_json_atomic};

pub const LEDGER_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub state: StageState,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedger {
    pub created_at: String,
    pub stages: Vec<StageRecord>,
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now().to_rfc3339(),
            stages: StageId::ALL
                .iter()
                .map(|stage| StageRecord {
                    stage: *stage,
                    state: StageState::Pending,
                    started_at: None,
                    finished_at: None,
                    succeeded: 0,
                    failed: 0,
                    error: None,
                })
                .collect(),
        }
    }

    pub fn load(store: &Store) -> Result<Self, DockError> {
        read_json(&store.root_file(LEDGER_FILE))
    }

    pub fn save(&self, store: &Store) -> Result<(), DockError> {
        write_json_atomic(&store.root_file(LEDGER_FILE), self)
    }

    pub fn state(&self, stage: StageId) -> StageState {
        self.record(stage)
            .map(|record| record.state)
            .unwrap_or(StageState::Pending)
    }

    pub fn running(&self) -> Option<StageId> {
        self.stages
            .iter()
            .find(|record| record.state == StageState::Running)
            .map(|record| record.stage)
    }

    pub fn start(&mut self, stage: StageId) -> Result<(), DockError> {
        if let Some(current) = self.running() {
            return Err(DockError::StageConflict {
                stage: stage.to_string(),
                running: current.to_string(),
            });
        }
        let record = self.record_mut(stage);
        record.state = StageState::Running;
        record.started_at = Some(Utc::now().to_rfc3339());
        record.finished_at = None;
        record.error = None;
        Ok(())
    }

    pub fn commit(&mut self, stage: StageId, manifest: &StageManifest) {
        let record = self.record_mut(stage);
        record.state = StageState::Committed;
        record.finished_at = Some(Utc::now().to_rfc3339());
        record.succeeded = manifest.succeeded.len();
        record.failed = manifest.failed.len();
    }

    pub fn fail(&mut self, stage: StageId, error: &DockError) {
        let record = self.record_mut(stage);
        record.state = StageState::Failed;
        record.finished_at = Some(Utc::now().to_rfc3339());
        record.error = Some(error.to_string());
    }

    pub fn mark_interrupted(&mut self) -> Option<StageId> {
        let stage = self.running()?;
        let record = self.record_mut(stage);
        record.state = StageState::Failed;
        record.error = Some("interrupted".to_string());
        Some(stage)
    }

    fn record(&self, stage: StageId) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == stage)
    }

    fn record_mut(&mut self, stage: StageId) -> &mut StageRecord {
        // ledgers written by older runs may lack a stage
        if self.record(stage).is_none() {
            self.stages.push(StageRecord {
                stage,
                state: StageState::Pending,
                started_at: None,
                finished_at: None,
                succeeded: 0,
                failed: 0,
                error: None,
            });
            self.stages.sort_by_key(|record| record.stage);
        }
        let index = self
            .stages
            .iter()
            .position(|record| record.stage == stage)
            .unwrap_or_default();
        &mut self.stages[index]
    }
}
