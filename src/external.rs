use std::io;
use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::batch::BatchManifest;
use crate::config::{DockingSettings, ProfilerSettings, ResolvedConfig};
use crate::domain::StageId;
use crate::error::DockError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn check(self, stage: StageId, program: &str) -> Result<ToolOutput, DockError> {
        if self.success() {
            return Ok(self);
        }
        Err(DockError::ExternalTool {
            stage: stage.dir_name().to_string(),
            program: program.to_string(),
            code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Utf8Path>,
    ) -> Result<ToolOutput, DockError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Utf8Path>,
    ) -> Result<ToolOutput, DockError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir.as_std_path());
        }
        debug!(program, ?args, "spawning process");
        let output = cmd.output().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => DockError::MissingTool(program.to_string()),
            _ => DockError::Filesystem(format!("failed to run {program}: {err}")),
        })?;
        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

pub fn require_tool(name: &str) -> Result<PathBuf, DockError> {
    let path = PathBuf::from(name);
    if path.components().count() > 1 {
        return if path.is_file() {
            Ok(path)
        } else {
            Err(DockError::MissingTool(name.to_string()))
        };
    }
    find_in_path(name).ok_or_else(|| DockError::MissingTool(name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    SdfToMol2,
    Mol2ToPdbqt,
    PdbqtToSmiles,
    PdbqtToSdf,
    ValidityFilter,
}

impl Script {
    pub fn file_name(self) -> &'static str {
        match self {
            Script::SdfToMol2 => "1_sdf_to_mol2.sh",
            Script::Mol2ToPdbqt => "2_mol2_to_pdbqt.sh",
            Script::PdbqtToSmiles => "3_pdbqt_to_smiles.sh",
            Script::PdbqtToSdf => "4_pdbqt_to_sdf.sh",
            Script::ValidityFilter => "5_posebusters_filter.sh",
        }
    }
}

pub struct ScriptRunner<'a, P: ProcessRunner + ?Sized> {
    process: &'a P,
    shell: String,
    scripts_dir: Utf8PathBuf,
}

impl<'a, P: ProcessRunner + ?Sized> ScriptRunner<'a, P> {
    pub fn new(process: &'a P, config: &ResolvedConfig) -> Self {
        Self {
            process,
            shell: config.shell.clone(),
            scripts_dir: config.scripts_dir.clone(),
        }
    }

    pub fn script_path(&self, script: Script) -> Utf8PathBuf {
        self.scripts_dir.join(script.file_name())
    }

    pub fn run(
        &self,
        stage: StageId,
        script: Script,
        args: &[String],
        cwd: &Utf8Path,
    ) -> Result<ToolOutput, DockError> {
        let script_path = self.script_path(script);
        if !script_path.as_std_path().is_file() {
            return Err(DockError::MissingTool(script_path.to_string()));
        }
        let mut full_args = vec![script_path.to_string()];
        full_args.extend(args.iter().cloned());
        info!(stage = %stage, script = script.file_name(), "running script");
        let output = self
            .process
            .run(&self.shell, &full_args, Some(cwd))?
            .check(stage, script.file_name())?;
        debug!(script = script.file_name(), stdout = %output.stdout.trim(), "script finished");
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded,
    Failed { code: Option<i32>, log: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub struct DockingJob<'a> {
    pub receptor: &'a Utf8Path,
    pub docking_config: &'a Utf8Path,
    pub output_dir: &'a Utf8Path,
    pub log_dir: &'a Utf8Path,
}

pub struct DockingTool<'a, P: ProcessRunner + ?Sized> {
    process: &'a P,
    settings: DockingSettings,
}

impl<'a, P: ProcessRunner + ?Sized> DockingTool<'a, P> {
    pub fn new(process: &'a P, settings: &DockingSettings) -> Self {
        Self {
            process,
            settings: settings.clone(),
        }
    }

    pub fn args(&self, manifest: &BatchManifest, job: &DockingJob<'_>) -> Vec<String> {
        let mut args = vec![
            "--receptor".to_string(),
            job.receptor.to_string(),
            "--gpu_batch".to_string(),
        ];
        args.extend(manifest.paths.iter().map(|path| path.to_string()));
        args.extend([
            "--search_mode".to_string(),
            self.settings.search_mode.clone(),
            "--scoring".to_string(),
            self.settings.scoring.clone(),
            "--config".to_string(),
            job.docking_config.to_string(),
            "--dir".to_string(),
            job.output_dir.to_string(),
        ]);
        args
    }

    /// Docks one batch and writes its combined output to
    /// `unidock_output_batch_<index>.txt` in the job's log directory.
    ///
    /// Only a missing executable or an unwritable log is an error; a nonzero
    /// exit is reported as [`BatchOutcome::Failed`].
    pub fn dock_batch(
        &self,
        manifest: &BatchManifest,
        job: &DockingJob<'_>,
    ) -> Result<BatchOutcome, DockError> {
        let args = self.args(manifest, job);
        info!(batch = manifest.index, ligands = manifest.paths.len(), "docking batch");
        let output = self.process.run(&self.settings.executable, &args, None)?;

        let log = job.log_dir.join(format!("unidock_output_batch_{}.txt", manifest.index));
        let mut content = output.stdout.clone();
        content.push_str(&output.stderr);
        std::fs::write(log.as_std_path(), content)
            .map_err(|err| DockError::Filesystem(format!("write {log}: {err}")))?;

        if output.success() {
            Ok(BatchOutcome::Succeeded)
        } else {
            warn!(
                batch = manifest.index,
                code = ?output.exit_code,
                log = %log,
                "docking batch failed"
            );
            Ok(BatchOutcome::Failed {
                code: output.exit_code,
                log,
            })
        }
    }
}

pub struct Profiler<'a, P: ProcessRunner + ?Sized> {
    process: &'a P,
    settings: ProfilerSettings,
}

impl<'a, P: ProcessRunner + ?Sized> Profiler<'a, P> {
    pub fn new(process: &'a P, settings: &ProfilerSettings) -> Self {
        Self {
            process,
            settings: settings.clone(),
        }
    }

    pub fn profile(&self, complex: &Utf8Path, output_dir: &Utf8Path) -> Result<ToolOutput, DockError> {
        let mut args = vec!["-f".to_string(), complex.to_string()];
        args.extend(self.settings.args.iter().cloned());
        args.extend(["-o".to_string(), output_dir.to_string()]);
        self.process
            .run(&self.settings.executable, &args, Some(output_dir))?
            .check(StageId::Interactions, &self.settings.executable)
    }
}
