use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::ThresholdSpec;
use crate::error::DockError;

pub const DEFAULT_CONFIG_FILE: &str = "agandock.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scripts_dir: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub obabel: Option<String>,
    #[serde(default)]
    pub docking: Option<DockingEntry>,
    #[serde(default)]
    pub profiler: Option<ProfilerEntry>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_heavy_atoms: Option<u32>,
    #[serde(default)]
    pub conformers: Option<u32>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub validity_pass_threshold: Option<u32>,
    #[serde(default)]
    pub candidate_threshold: Option<ThresholdSpec>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DockingEntry {
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub search_mode: Option<String>,
    #[serde(default)]
    pub scoring: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProfilerEntry {
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockingSettings {
    pub executable: String,
    pub search_mode: String,
    pub scoring: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfilerSettings {
    pub executable: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub scripts_dir: Utf8PathBuf,
    pub shell: String,
    pub obabel: String,
    pub docking: DockingSettings,
    pub profiler: ProfilerSettings,
    pub batch_size: usize,
    pub max_heavy_atoms: u32,
    pub conformers: u32,
    pub workers: Option<usize>,
    pub validity_pass_threshold: u32,
    pub candidate_threshold: Option<ThresholdSpec>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `agandock.json` in the current directory when no path
    /// is given. Only an explicitly named file has to exist.
    pub fn resolve(
        path: Option<&str>,
        scripts_dir: Option<&str>,
    ) -> Result<ResolvedConfig, DockError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| DockError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| DockError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, scripts_dir)
    }

    pub fn resolve_config(
        config: Config,
        scripts_dir: Option<&str>,
    ) -> Result<ResolvedConfig, DockError> {
        let scripts_dir = scripts_dir
            .map(str::to_string)
            .or(config.scripts_dir)
            .filter(|dir| !dir.trim().is_empty())
            .map(Utf8PathBuf::from)
            .ok_or(DockError::MissingScriptsDir)?;

        let batch_size = config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(DockError::InvalidBatchSize(batch_size));
        }
        if let Some(threshold) = &config.candidate_threshold {
            threshold.validate()?;
        }

        let docking = config.docking.unwrap_or_default();
        let profiler = config.profiler.unwrap_or_default();

        Ok(ResolvedConfig {
            scripts_dir,
            shell: config.shell.unwrap_or_else(|| "/bin/bash".to_string()),
            obabel: config.obabel.unwrap_or_else(|| "obabel".to_string()),
            docking: DockingSettings {
                executable: docking.executable.unwrap_or_else(|| "unidock".to_string()),
                search_mode: docking.search_mode.unwrap_or_else(|| "detail".to_string()),
                scoring: docking.scoring.unwrap_or_else(|| "vina".to_string()),
            },
            profiler: ProfilerSettings {
                executable: profiler.executable.unwrap_or_else(|| "plip".to_string()),
                args: profiler.args.unwrap_or_else(default_profiler_args),
            },
            batch_size,
            max_heavy_atoms: config.max_heavy_atoms.unwrap_or(DEFAULT_MAX_HEAVY_ATOMS),
            conformers: config.conformers.unwrap_or(DEFAULT_CONFORMERS).max(1),
            workers: config.workers.filter(|workers| *workers > 0),
            validity_pass_threshold: config
                .validity_pass_threshold
                .unwrap_or(DEFAULT_VALIDITY_PASS_THRESHOLD),
            candidate_threshold: config.candidate_threshold,
        })
    }
}

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_HEAVY_ATOMS: u32 = 50;
pub const DEFAULT_CONFORMERS: u32 = 10;
pub const DEFAULT_VALIDITY_PASS_THRESHOLD: u32 = 19;

pub fn default_profiler_args() -> Vec<String> {
    vec!["-yvxt".to_string()]
}
