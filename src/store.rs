use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tempfile::{Builder, TempDir};
use tracing::{debug, info};

use crate::domain::{CompoundName, StageId};
use crate::error::DockError;

const STAGES_DIR: &str = "stages";
const MANIFEST_FILE: &str = "manifest.json";
const RUN_PREFIX: &str = "agandock";
const INPUTS_DIR: &str = "inputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    Reject,
    Replace,
}

#[derive(Debug, Clone)]
pub struct Store {
    run_root: Utf8PathBuf,
}

impl Store {
    pub fn create_run<Tz: TimeZone>(
        output_dir: &Utf8Path,
        now: &DateTime<Tz>,
    ) -> Result<Self, DockError>
    where
        Tz::Offset: std::fmt::Display,
    {
        let output_dir = absolute_path(output_dir)?;
        fs::create_dir_all(output_dir.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("create {output_dir}: {err}")))?;
        let run_root = output_dir.join(run_dir_name(now));
        match fs::create_dir(run_root.as_std_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DockError::RunRootExists(run_root.into_std_path_buf()));
            }
            Err(err) => {
                return Err(DockError::Filesystem(format!("create {run_root}: {err}")));
            }
        }
        fs::create_dir_all(run_root.join(STAGES_DIR).as_std_path())
            .map_err(|err| DockError::Filesystem(err.to_string()))?;
        info!(run_root = %run_root, "created run root");
        Ok(Self { run_root })
    }

    pub fn open(run_root: &Utf8Path) -> Result<Self, DockError> {
        let run_root = absolute_path(run_root)?;
        if !run_root.join(STAGES_DIR).as_std_path().is_dir() {
            return Err(DockError::Filesystem(format!(
                "{run_root} is not a pipeline run directory"
            )));
        }
        Ok(Self { run_root })
    }

    pub fn run_root(&self) -> &Utf8Path {
        &self.run_root
    }

    pub fn stages_root(&self) -> Utf8PathBuf {
        self.run_root.join(STAGES_DIR)
    }

    pub fn stage_dir(&self, stage: StageId) -> Utf8PathBuf {
        self.stages_root().join(stage.dir_name())
    }

    pub fn artifact_path(&self, stage: StageId, name: &CompoundName) -> Utf8PathBuf {
        self.stage_dir(stage).join(artifact_file_name(stage, name))
    }

    pub fn root_file(&self, file_name: &str) -> Utf8PathBuf {
        self.run_root.join(file_name)
    }

    pub fn is_committed(&self, stage: StageId) -> bool {
        self.stage_dir(stage).join(MANIFEST_FILE).as_std_path().is_file()
    }

    /// Stages a new directory for `stage`. Nothing becomes visible under the
    /// stage's final name until [`StageWriter::commit`].
    pub fn create_stage(
        &self,
        stage: StageId,
        overwrite: Overwrite,
    ) -> Result<StageWriter, DockError> {
        let final_dir = self.stage_dir(stage);
        if final_dir.as_std_path().exists() {
            match overwrite {
                Overwrite::Reject if !is_empty_dir(final_dir.as_std_path())? => {
                    return Err(DockError::StageExists(stage.dir_name().to_string()));
                }
                Overwrite::Reject => {}
                Overwrite::Replace if !stage.is_rerunnable() => {
                    return Err(DockError::StageNotRerunnable(stage.dir_name().to_string()));
                }
                Overwrite::Replace => {
                    debug!(stage = %stage, "removing previous stage contents");
                    fs::remove_dir_all(final_dir.as_std_path())
                        .map_err(|err| DockError::Filesystem(err.to_string()))?;
                }
            }
        }

        let stages_root = self.stages_root();
        fs::create_dir_all(stages_root.as_std_path())
            .map_err(|err| DockError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(&format!(".tmp-{}-", stage.dir_name()))
            .tempdir_in(stages_root.as_std_path())
            .map_err(|err| DockError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(|_| DockError::Filesystem("invalid temp dir".to_string()))?;
        Ok(StageWriter {
            stage,
            temp,
            path,
            final_dir,
        })
    }

    pub fn list_artifacts(&self, stage: StageId) -> Result<Vec<CompoundName>, DockError> {
        if !self.is_committed(stage) {
            return Err(DockError::StageMissing(stage.dir_name().to_string()));
        }
        list_stage_dir(stage, &self.stage_dir(stage))
    }

    pub fn copy_artifact(
        &self,
        from: StageId,
        to: &StageWriter,
        name: &CompoundName,
    ) -> Result<Utf8PathBuf, DockError> {
        let source = self.artifact_path(from, name);
        let dest = to.artifact_path(name);
        fs::copy(source.as_std_path(), dest.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("copy {source}: {err}")))?;
        Ok(dest)
    }

    pub fn read_manifest(&self, stage: StageId) -> Result<StageManifest, DockError> {
        if !self.is_committed(stage) {
            return Err(DockError::StageMissing(stage.dir_name().to_string()));
        }
        read_json(&self.stage_dir(stage).join(MANIFEST_FILE))
    }

    pub fn read_stage_file(&self, stage: StageId, file_name: &str) -> Result<Vec<u8>, DockError> {
        if !self.is_committed(stage) {
            return Err(DockError::StageMissing(stage.dir_name().to_string()));
        }
        let path = self.stage_dir(stage).join(file_name);
        fs::read(path.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("read {path}: {err}")))
    }

    pub fn write_root_file(&self, file_name: &str, content: &[u8]) -> Result<Utf8PathBuf, DockError> {
        validate_file_name(file_name)?;
        let path = self.root_file(file_name);
        write_bytes_atomic(&path, content)?;
        Ok(path)
    }

    pub fn remove_root_file(&self, file_name: &str) -> Result<(), DockError> {
        validate_file_name(file_name)?;
        let path = self.root_file(file_name);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DockError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn read_root_file(&self, file_name: &str) -> Result<Vec<u8>, DockError> {
        let path = self.root_file(file_name);
        fs::read(path.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("read {path}: {err}")))
    }

    pub fn import_input(&self, source: &Utf8Path, file_name: &str) -> Result<Utf8PathBuf, DockError> {
        validate_file_name(file_name)?;
        let dest = self.input_path(file_name);
        copy_file_atomic(source, &dest)?;
        Ok(dest)
    }

    pub fn input_path(&self, file_name: &str) -> Utf8PathBuf {
        self.run_root.join(INPUTS_DIR).join(file_name)
    }
}

/// An uncommitted stage directory. Dropping it discards everything written.
#[derive(Debug)]
pub struct StageWriter {
    stage: StageId,
    temp: TempDir,
    path: Utf8PathBuf,
    final_dir: Utf8PathBuf,
}

impl StageWriter {
    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn artifact_path(&self, name: &CompoundName) -> Utf8PathBuf {
        self.path.join(artifact_file_name(self.stage, name))
    }

    pub fn write_artifact(&self, name: &CompoundName, content: &[u8]) -> Result<Utf8PathBuf, DockError> {
        let path = self.artifact_path(name);
        fs::write(path.as_std_path(), content)
            .map_err(|err| DockError::Filesystem(format!("write {path}: {err}")))?;
        Ok(path)
    }

    pub fn write_side_file(&self, file_name: &str, content: &[u8]) -> Result<Utf8PathBuf, DockError> {
        validate_file_name(file_name)?;
        let path = self.path.join(file_name);
        fs::write(path.as_std_path(), content)
            .map_err(|err| DockError::Filesystem(format!("write {path}: {err}")))?;
        Ok(path)
    }

    pub fn create_subdir(&self, dir_name: &str) -> Result<Utf8PathBuf, DockError> {
        validate_file_name(dir_name)?;
        let path = self.path.join(dir_name);
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("create {path}: {err}")))?;
        Ok(path)
    }

    pub fn list_artifacts(&self) -> Result<Vec<CompoundName>, DockError> {
        list_stage_dir(self.stage, &self.path)
    }

    /// Publishes the stage under its final name.
    ///
    /// Every name in `expected` that has no artifact and no entry in `failed`
    /// is recorded as failed with a generic reason.
    pub fn commit(
        self,
        expected: &[CompoundName],
        failed: BTreeMap<CompoundName, String>,
    ) -> Result<StageManifest, DockError> {
        let succeeded = self.list_artifacts()?;
        let mut failed = failed;
        for name in expected {
            if succeeded.binary_search(name).is_err() && !failed.contains_key(name) {
                failed.insert(name.clone(), "no artifact produced".to_string());
            }
        }
        self.commit_manifest(succeeded, failed)
    }

    pub fn commit_items(
        self,
        succeeded: Vec<CompoundName>,
        failed: BTreeMap<CompoundName, String>,
    ) -> Result<StageManifest, DockError> {
        let mut succeeded = succeeded;
        succeeded.sort();
        succeeded.dedup();
        self.commit_manifest(succeeded, failed)
    }

    fn commit_manifest(
        self,
        succeeded: Vec<CompoundName>,
        failed: BTreeMap<CompoundName, String>,
    ) -> Result<StageManifest, DockError> {
        let manifest = StageManifest {
            stage: self.stage,
            committed_at: chrono::Utc::now().to_rfc3339(),
            succeeded,
            failed: failed
                .into_iter()
                .map(|(name, reason)| FailedItem { name, reason })
                .collect(),
        };
        let content = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| DockError::Filesystem(err.to_string()))?;
        fs::write(self.path.join(MANIFEST_FILE).as_std_path(), content)
            .map_err(|err| DockError::Filesystem(err.to_string()))?;

        atomic_rename_dir(self.path.as_std_path(), self.final_dir.as_std_path())
            .map_err(|err| DockError::Filesystem(format!("commit {}: {err}", self.final_dir)))?;
        // the temp path has been renamed away; dropping the guard is a no-op
        drop(self.temp);
        info!(
            stage = %manifest.stage,
            succeeded = manifest.succeeded.len(),
            failed = manifest.failed.len(),
            "stage committed"
        );
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: StageId,
    pub committed_at: String,
    pub succeeded: Vec<CompoundName>,
    pub failed: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub name: CompoundName,
    pub reason: String,
}

pub fn absolute_path(path: &Utf8Path) -> Result<Utf8PathBuf, DockError> {
    let absolute = std::path::absolute(path.as_std_path())
        .map_err(|err| DockError::Filesystem(format!("resolve {path}: {err}")))?;
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|_| DockError::Filesystem(format!("{path} is not valid UTF-8")))
}

pub fn run_dir_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{RUN_PREFIX}_{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn artifact_file_name(stage: StageId, name: &CompoundName) -> String {
    format!("{}{}", name.as_str(), stage.artifact_suffix())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DockError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| DockError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| DockError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), DockError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| DockError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, DockError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| DockError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| DockError::Filesystem(format!("{path}: {err}")))
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), DockError> {
    let parent = dest
        .parent()
        .ok_or_else(|| DockError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| DockError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".agandock-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| DockError::Filesystem(err.to_string()))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| DockError::Filesystem(format!("copy {source}: {err}")))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| DockError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

fn list_stage_dir(stage: StageId, dir: &Utf8Path) -> Result<Vec<CompoundName>, DockError> {
    let suffix = stage.artifact_suffix();
    let mut names = Vec::new();
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| DockError::Filesystem(format!("list {dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| DockError::Filesystem(err.to_string()))?;
        if !entry.path().is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(suffix) else {
            continue;
        };
        match stem.parse::<CompoundName>() {
            Ok(name) => names.push(name),
            Err(_) => debug!(file = file_name, "skipping file without a compound name"),
        }
    }
    // directory order is filesystem dependent
    names.sort();
    names.dedup();
    Ok(names)
}

fn is_empty_dir(path: &Path) -> Result<bool, DockError> {
    let mut entries = fs::read_dir(path).map_err(|err| DockError::Filesystem(err.to_string()))?;
    Ok(entries.next().is_none())
}

fn validate_file_name(file_name: &str) -> Result<(), DockError> {
    let is_valid = !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && !file_name.contains('/')
        && !file_name.contains('\\');
    if !is_valid {
        return Err(DockError::Filesystem(format!(
            "file name {file_name:?} would escape its directory"
        )));
    }
    Ok(())
}
