use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DockError {
    #[error("invalid compound name: {0:?}")]
    InvalidCompoundName(String),

    #[error("input table is missing required column: {0}")]
    #[diagnostic(help("the input CSV needs a SMILES column; Name is optional"))]
    MissingColumn(String),

    #[error("malformed input table: {0}")]
    MalformedInput(String),

    #[error("malformed stage artifact: {0}")]
    MalformedArtifact(String),

    #[error("duplicate compound name: {0}")]
    DuplicateIdentity(String),

    #[error("input contains no compounds")]
    EmptyInput,

    #[error("batch size must be positive, got {0}")]
    InvalidBatchSize(usize),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no scripts directory configured")]
    #[diagnostic(help("set scripts_dir in agandock.json or pass --scripts-dir"))]
    MissingScriptsDir,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("run root already exists: {0}")]
    RunRootExists(PathBuf),

    #[error("stage {0} already exists and is not empty")]
    StageExists(String),

    #[error("stage {0} has not been committed")]
    StageMissing(String),

    #[error("stage {0} belongs to the finished run and cannot be replaced")]
    StageNotRerunnable(String),

    #[error("cannot start stage {stage} while {running} is running")]
    StageConflict { stage: String, running: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("chemistry tool failed: {0}")]
    ChemistryTool(String),

    #[error("{program} exited with {} during stage {stage}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}", exit_label(.code))]
    ExternalTool {
        stage: String,
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("pipeline cancelled before stage output was published")]
    Cancelled,

    #[error("stage {stage} failed")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<DockError>,
    },
}

impl DockError {
    /// True for errors raised before any run root is touched.
    pub fn is_input_contract(&self) -> bool {
        match self {
            DockError::InvalidCompoundName(_)
            | DockError::MissingColumn(_)
            | DockError::MalformedInput(_)
            | DockError::DuplicateIdentity(_)
            | DockError::EmptyInput
            | DockError::InvalidBatchSize(_)
            | DockError::InvalidThreshold(_) => true,
            DockError::StageFailed { source, .. } => source.is_input_contract(),
            _ => false,
        }
    }

    pub fn external_exit_code(&self) -> Option<i32> {
        match self {
            DockError::ExternalTool { code, .. } => *code,
            DockError::StageFailed { source, .. } => source.external_exit_code(),
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no exit status (terminated by signal)".to_string(),
    }
}
