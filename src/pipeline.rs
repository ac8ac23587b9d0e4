use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{self, BatchManifest};
use crate::chem::Chemistry;
use crate::config::ResolvedConfig;
use crate::domain::{CompoundName, InputCompound, StageId, ThresholdSpec};
use crate::error::DockError;
use crate::external::{
    BatchOutcome, DockingJob, DockingTool, ProcessRunner, Profiler, Script, ScriptRunner,
};
use crate::formats;
use crate::ledger::RunLedger;
use crate::registry::{Exclusion, IdentityRegistry, JoinKind, NamedTable, RegistryRow};
use crate::runner::{CancelToken, ItemOutcome, TaskRunner};
use crate::store::{Overwrite, StageManifest, Store, read_json, write_json_atomic};
use crate::tables::{self, SummaryRow, ValidityRow};
use crate::threshold::{self, SELECTION_FILE};
use crate::verify;

pub const INPUT_TABLE_FILE: &str = "input_smiles.csv";
pub const SALTED_FILE: &str = "salted_compounds.csv";
pub const REGISTRY_FILE: &str = "registry.json";
pub const RANKED_FILE: &str = "output.csv";
pub const WITH_VALIDITY_FILE: &str = "output_with_validity.csv";
pub const WITHOUT_VALIDITY_FILE: &str = "output_without_validity.csv";
pub const AFFINITY_FILE: &str = "affinity.csv";
pub const VERIFICATION_FILE: &str = "compounds_for_docking.csv";
pub const VALIDITY_FILE: &str = "validity.csv";
pub const VALIDITY_RAW_FILE: &str = "validity_raw.csv";
pub const RECEPTOR_PDB: &str = "receptor.pdb";
pub const RECEPTOR_PDBQT: &str = "receptor.pdbqt";
pub const DOCKING_CONFIG: &str = "docking_config.txt";

#[derive(Debug, Clone)]
pub enum CompoundSource {
    Table(Utf8PathBuf),
    Smiles(String),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub compounds: CompoundSource,
    pub receptor_pdb: Utf8PathBuf,
    pub receptor_pdbqt: Utf8PathBuf,
    pub docking_config: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub low: f64,
    pub high: f64,
}

impl ScoreRange {
    pub fn spec(&self) -> ThresholdSpec {
        ThresholdSpec::Range {
            low: self.low,
            high: self.high,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_root: String,
    pub compounds: usize,
    pub salts: usize,
    pub batches: usize,
    pub failed_batches: Vec<usize>,
    pub docked: usize,
    pub ranked: usize,
    pub complexes: usize,
    pub excluded: BTreeMap<String, usize>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub run_root: String,
    pub selected: usize,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub with_validity: String,
    pub without_validity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileResult {
    pub run_root: String,
    pub selected: usize,
    pub profiled: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

struct RunContext<'s> {
    store: Store,
    ledger: RunLedger,
    registry: IdentityRegistry,
    sink: &'s dyn ProgressSink,
    started: Instant,
}

impl RunContext<'_> {
    fn progress(&self, message: String) {
        self.sink.event(ProgressEvent {
            message,
            elapsed: Some(self.started.elapsed()),
        });
    }

    fn save_registry(&self) -> Result<(), DockError> {
        write_json_atomic(
            &self.store.root_file(REGISTRY_FILE),
            &self.registry.to_snapshot(),
        )
    }
}

pub struct Pipeline<C: Chemistry, P: ProcessRunner> {
    config: ResolvedConfig,
    chemistry: C,
    process: P,
    runner: TaskRunner,
}

impl<C: Chemistry, P: ProcessRunner> Pipeline<C, P> {
    pub fn new(config: ResolvedConfig, chemistry: C, process: P) -> Result<Self, DockError> {
        let runner = TaskRunner::new(config.workers)?;
        Ok(Self {
            config,
            chemistry,
            process,
            runner,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.runner.cancel_token()
    }

    pub fn run(&self, request: &RunRequest, sink: &dyn ProgressSink) -> Result<RunResult, DockError> {
        let compounds = match &request.compounds {
            CompoundSource::Table(path) => tables::read_input_table(path)?,
            CompoundSource::Smiles(smiles) => tables::single_compound(smiles)?,
        };
        for path in [
            &request.receptor_pdb,
            &request.receptor_pdbqt,
            &request.docking_config,
        ] {
            if !path.as_std_path().is_file() {
                return Err(DockError::MalformedInput(format!("input file not found: {path}")));
            }
        }
        let registry = IdentityRegistry::seed(&compounds)?;

        let store = Store::create_run(&request.output_dir, &Local::now())?;
        store.import_input(&request.receptor_pdb, RECEPTOR_PDB)?;
        store.import_input(&request.receptor_pdbqt, RECEPTOR_PDBQT)?;
        store.import_input(&request.docking_config, DOCKING_CONFIG)?;
        store.write_root_file(INPUT_TABLE_FILE, &tables::write_compounds(&compounds)?)?;

        let mut ctx = RunContext {
            store,
            ledger: RunLedger::new(),
            registry,
            sink,
            started: Instant::now(),
        };
        ctx.ledger.save(&ctx.store)?;
        ctx.progress(format!("phase=Prepare; {} compounds", compounds.len()));

        let salts = self.prefilter(&mut ctx)?;

        self.run_stage(&mut ctx, StageId::Structures, |ctx| self.generate_structures(ctx))?;
        self.run_stage(&mut ctx, StageId::Mol2, |ctx| {
            self.convert_with_script(ctx, StageId::Mol2, Script::SdfToMol2, StageId::Structures)
        })?;
        self.run_stage(&mut ctx, StageId::Mol2Renumbered, |ctx| self.renumber_atoms(ctx))?;
        self.run_stage(&mut ctx, StageId::Pdbqt, |ctx| {
            self.convert_with_script(ctx, StageId::Pdbqt, Script::Mol2ToPdbqt, StageId::Mol2Renumbered)
        })?;
        self.run_stage(&mut ctx, StageId::RoundTrip, |ctx| {
            self.convert_with_script(ctx, StageId::RoundTrip, Script::PdbqtToSmiles, StageId::Pdbqt)
        })?;
        self.run_stage(&mut ctx, StageId::DockingInput, |ctx| self.verify_round_trip(ctx))?;
        let manifests = self.run_stage(&mut ctx, StageId::Batches, |ctx| self.plan_batches(ctx))?;
        let failed_batches =
            self.run_stage(&mut ctx, StageId::Docked, |ctx| self.dock(ctx, &manifests))?;
        let scores = self.run_stage(&mut ctx, StageId::Scores, |ctx| self.extract_scores(ctx))?;

        let mut pose_source = StageId::Docked;
        if let Some(spec) = self.config.candidate_threshold {
            self.run_stage(&mut ctx, StageId::Candidates, |ctx| {
                let extraction = threshold::extract(
                    &ctx.store,
                    StageId::Docked,
                    StageId::Candidates,
                    &scores,
                    &spec,
                    Overwrite::Reject,
                )?;
                ctx.registry
                    .retain_active(&extraction.manifest.succeeded, |_| Exclusion::BelowThreshold);
                Ok(((), extraction.manifest))
            })?;
            pose_source = StageId::Candidates;
        }

        self.run_stage(&mut ctx, StageId::FirstPose, |ctx| self.extract_first_pose(ctx, pose_source))?;
        self.run_stage(&mut ctx, StageId::DockedSdf, |ctx| {
            self.convert_with_script(ctx, StageId::DockedSdf, Script::PdbqtToSdf, StageId::FirstPose)
        })?;

        let ranked = self.write_ranked(&mut ctx, &scores)?;
        let complexes =
            self.run_stage(&mut ctx, StageId::Complexes, |ctx| self.assemble_complexes(ctx, &ranked))?;
        ctx.save_registry()?;

        let mut excluded = BTreeMap::new();
        for (_, record) in ctx.registry.records().iter() {
            if let Some(reason) = &record.excluded {
                *excluded.entry(reason.label().to_string()).or_insert(0) += 1;
            }
        }
        ctx.progress(format!("phase=Done; ranked={}", ranked.len()));
        info!(run_root = %ctx.store.run_root(), ranked = ranked.len(), "run finished");

        Ok(RunResult {
            run_root: ctx.store.run_root().to_string(),
            compounds: compounds.len(),
            salts,
            batches: manifests.len(),
            failed_batches,
            docked: scores.len(),
            ranked: ranked.len(),
            complexes,
            excluded,
            output: ctx.store.root_file(RANKED_FILE).to_string(),
        })
    }

    /// Re-runs range extraction and the validity check against an existing
    /// run. Only the re-runnable stages are replaced.
    pub fn filter(
        &self,
        run_root: &Utf8Path,
        range: ScoreRange,
        sink: &dyn ProgressSink,
    ) -> Result<FilterResult, DockError> {
        let spec = range.spec();
        spec.validate()?;
        let mut ctx = self.reopen(run_root, sink)?;
        for file_name in [WITH_VALIDITY_FILE, WITHOUT_VALIDITY_FILE] {
            ctx.store.remove_root_file(file_name)?;
        }

        let scores = tables::read_scores(&ctx.store.read_stage_file(StageId::Scores, AFFINITY_FILE)?)?;
        let available = ctx.store.list_artifacts(StageId::DockedSdf)?;
        let scored: Vec<(CompoundName, f64)> = scores
            .into_iter()
            .filter(|(name, _)| available.binary_search(name).is_ok())
            .collect();

        let selected = self.run_stage(&mut ctx, StageId::ValidityInput, |ctx| {
            let extraction = threshold::extract(
                &ctx.store,
                StageId::DockedSdf,
                StageId::ValidityInput,
                &scored,
                &spec,
                Overwrite::Replace,
            )?;
            Ok((extraction.selected, extraction.manifest))
        })?;
        let ranked = tables::read_summary(&ctx.store.read_root_file(RANKED_FILE)?)?;
        let (passed, failed) = self.run_stage(&mut ctx, StageId::Validity, |ctx| {
            self.check_validity(ctx, &selected, ranked)
        })?;

        let with_validity = publish_stage_file(&ctx.store, StageId::Validity, WITH_VALIDITY_FILE)?;
        let without_validity =
            publish_stage_file(&ctx.store, StageId::Validity, WITHOUT_VALIDITY_FILE)?;
        ctx.save_registry()?;
        info!(
            selected = selected.len(),
            passed = passed.len(),
            failed = failed.len(),
            "validity filter finished"
        );

        Ok(FilterResult {
            run_root: ctx.store.run_root().to_string(),
            selected: selected.len(),
            passed: passed.iter().map(|row| row.name.to_string()).collect(),
            failed: failed.iter().map(|row| row.name.to_string()).collect(),
            with_validity: with_validity.to_string(),
            without_validity: without_validity.to_string(),
        })
    }

    pub fn profile(
        &self,
        run_root: &Utf8Path,
        range: ScoreRange,
        sink: &dyn ProgressSink,
    ) -> Result<ProfileResult, DockError> {
        let spec = range.spec();
        spec.validate()?;
        let mut ctx = self.reopen(run_root, sink)?;

        let ranked = tables::read_summary(&ctx.store.read_root_file(RANKED_FILE)?)?;
        let scored: Vec<(CompoundName, f64)> =
            ranked.iter().map(|row| (row.name.clone(), row.score)).collect();
        let selected = threshold::select(&scored, &spec)?;
        let complexes = ctx.store.list_artifacts(StageId::Complexes)?;

        let (profiled, missing) = self.run_stage(&mut ctx, StageId::Interactions, |ctx| {
            let writer = ctx.store.create_stage(StageId::Interactions, Overwrite::Replace)?;
            writer.write_side_file(SELECTION_FILE, &tables::write_scores(&selected)?)?;
            let profiler = Profiler::new(&self.process, &self.config.profiler);

            let mut profiled = Vec::new();
            let mut failed = BTreeMap::new();
            for (name, _) in &selected {
                self.ensure_not_cancelled()?;
                if complexes.binary_search(name).is_err() {
                    failed.insert(name.clone(), "no complex for compound".to_string());
                    continue;
                }
                let output_dir = writer.create_subdir(name.as_str())?;
                profiler.profile(&ctx.store.artifact_path(StageId::Complexes, name), &output_dir)?;
                profiled.push(name.clone());
            }
            let missing: Vec<CompoundName> = failed.keys().cloned().collect();
            let manifest = writer.commit_items(profiled.clone(), failed)?;
            Ok(((profiled, missing), manifest))
        })?;

        Ok(ProfileResult {
            run_root: ctx.store.run_root().to_string(),
            selected: selected.len(),
            profiled: profiled.iter().map(ToString::to_string).collect(),
            missing: missing.iter().map(ToString::to_string).collect(),
        })
    }

    fn reopen<'s>(&self, run_root: &Utf8Path, sink: &'s dyn ProgressSink) -> Result<RunContext<'s>, DockError> {
        let store = Store::open(run_root)?;
        let mut ledger = RunLedger::load(&store)?;
        if let Some(stage) = ledger.mark_interrupted() {
            warn!(stage = %stage, "previous invocation stopped while this stage was running");
        }
        let rows: Vec<RegistryRow> = read_json(&store.root_file(REGISTRY_FILE))?;
        let registry = IdentityRegistry::from_snapshot(rows)?;
        Ok(RunContext {
            store,
            ledger,
            registry,
            sink,
            started: Instant::now(),
        })
    }

    fn ensure_not_cancelled(&self) -> Result<(), DockError> {
        if self.runner.cancel_token().is_cancelled() {
            return Err(DockError::Cancelled);
        }
        Ok(())
    }

    fn run_stage<'s, T, F>(&self, ctx: &mut RunContext<'s>, stage: StageId, body: F) -> Result<T, DockError>
    where
        F: FnOnce(&mut RunContext<'s>) -> Result<(T, StageManifest), DockError>,
    {
        self.ensure_not_cancelled()?;
        ctx.ledger.start(stage)?;
        ctx.ledger.save(&ctx.store)?;
        ctx.progress(format!("phase={stage}; running"));
        let started = Instant::now();

        match body(ctx) {
            Ok((value, manifest)) => {
                ctx.ledger.commit(stage, &manifest);
                ctx.ledger.save(&ctx.store)?;
                ctx.save_registry()?;
                ctx.sink.event(ProgressEvent {
                    message: format!(
                        "phase={stage}; committed succeeded={} failed={}",
                        manifest.succeeded.len(),
                        manifest.failed.len()
                    ),
                    elapsed: Some(started.elapsed()),
                });
                Ok(value)
            }
            Err(err) => {
                ctx.ledger.fail(stage, &err);
                if let Err(save_err) = ctx.ledger.save(&ctx.store) {
                    warn!(stage = %stage, error = %save_err, "could not record stage failure");
                }
                Err(stage_failed(stage, err))
            }
        }
    }

    fn prefilter(&self, ctx: &mut RunContext<'_>) -> Result<usize, DockError> {
        let active = ctx.registry.active_smiles();
        let salt_flags = NamedTable::from_rows(
            active
                .iter()
                .map(|(name, smiles)| (name.clone(), !smiles.contains('.'))),
        )?;
        ctx.registry
            .accrete(&salt_flags, |record, salt_free| record.salt_free = Some(*salt_free));

        let mut salts = Vec::new();
        for (name, salt_free) in salt_flags.iter() {
            if !salt_free {
                ctx.registry.exclude(name, Exclusion::Salt);
                if let Some(smiles) = active.get(name) {
                    salts.push(InputCompound {
                        name: name.clone(),
                        smiles: smiles.clone(),
                    });
                }
            }
        }
        ctx.store
            .write_root_file(SALTED_FILE, &tables::write_compounds(&salts)?)?;

        let items: Vec<(CompoundName, String)> = ctx.registry.active_smiles().into_rows().collect();
        let report = self.runner.run("count heavy atoms", &items, |_, smiles| {
            ItemOutcome::Ok(self.chemistry.heavy_atoms(smiles))
        })?;
        let counts = NamedTable::from_rows(report.succeeded)?;
        let max = self.config.max_heavy_atoms;
        ctx.registry.accrete(&counts, |record, count| {
            record.heavy_atoms = *count;
            record.size_ok = Some(count.is_some_and(|count| count <= max));
        });
        for (name, count) in counts.iter() {
            if !count.is_some_and(|count| count <= max) {
                ctx.registry.exclude(name, Exclusion::TooLarge);
            }
        }
        for name in report.failed.keys() {
            ctx.registry.exclude(name, Exclusion::TooLarge);
        }
        ctx.save_registry()?;
        info!(
            salts = salts.len(),
            active = ctx.registry.active().len(),
            "salt and size filter applied"
        );
        Ok(salts.len())
    }

    fn generate_structures(&self, ctx: &mut RunContext<'_>) -> Result<((), StageManifest), DockError> {
        let items: Vec<(CompoundName, String)> = ctx.registry.active_smiles().into_rows().collect();
        let writer = ctx.store.create_stage(StageId::Structures, Overwrite::Reject)?;
        let report = self.runner.run("generate 3D structures", &items, |name, smiles| {
            ItemOutcome::from(
                self.chemistry
                    .generate_3d(name, smiles)
                    .and_then(|sdf| writer.write_artifact(name, sdf.as_bytes())),
            )
        })?;
        let expected = item_names(&items);
        let manifest = writer.commit(&expected, report.failed)?;
        drop_failed(&mut ctx.registry, &manifest, Exclusion::StructureFailed);
        Ok(((), manifest))
    }

    fn convert_with_script(
        &self,
        ctx: &mut RunContext<'_>,
        stage: StageId,
        script: Script,
        input: StageId,
    ) -> Result<((), StageManifest), DockError> {
        let writer = ctx.store.create_stage(stage, Overwrite::Reject)?;
        let scripts = ScriptRunner::new(&self.process, &self.config);
        let args = [ctx.store.stage_dir(input).to_string(), writer.path().to_string()];
        scripts.run(stage, script, &args, ctx.store.run_root())?;

        let expected = ctx.registry.active();
        let manifest = writer.commit(&expected, BTreeMap::new())?;
        drop_failed(&mut ctx.registry, &manifest, Exclusion::ConversionFailed);
        Ok(((), manifest))
    }

    fn renumber_atoms(&self, ctx: &mut RunContext<'_>) -> Result<((), StageManifest), DockError> {
        let items = artifact_items(ctx, StageId::Mol2);
        let writer = ctx.store.create_stage(StageId::Mol2Renumbered, Overwrite::Reject)?;
        let report = self.runner.run("renumber MOL2 atoms", &items, |name, path| {
            ItemOutcome::from(
                read_text(path)
                    .and_then(|content| {
                        formats::renumber_mol2_atoms(&content).map_err(DockError::MalformedArtifact)
                    })
                    .and_then(|content| writer.write_artifact(name, content.as_bytes())),
            )
        })?;
        let manifest = writer.commit(&item_names(&items), report.failed)?;
        drop_failed(&mut ctx.registry, &manifest, Exclusion::ConversionFailed);
        Ok(((), manifest))
    }

    fn verify_round_trip(&self, ctx: &mut RunContext<'_>) -> Result<((), StageManifest), DockError> {
        let items = artifact_items(ctx, StageId::RoundTrip);
        let parsed = self.runner.run("parse round trip", &items, |_, path| match read_text(path) {
            Ok(content) => tables::parse_round_trip(&content),
            Err(err) => ItemOutcome::Malformed(err.to_string()),
        })?;
        let recovered = NamedTable::from_rows(parsed.succeeded)?;
        let declared = ctx.registry.active_smiles();
        let verification =
            verify::verify_identity(&declared, &recovered, &self.chemistry, &self.runner)?;

        let scores = NamedTable::from_rows(verification.scores.clone())?;
        ctx.registry.accrete(&scores, |record, score| {
            record.similarity = *score;
            record.identity_verified = Some(verify::is_exact(*score));
        });

        let writer = ctx.store.create_stage(StageId::DockingInput, Overwrite::Reject)?;
        for name in &verification.verified {
            ctx.store.copy_artifact(StageId::Pdbqt, &writer, name)?;
        }
        let verified_rows: Vec<(CompoundName, f64)> = verification
            .verified
            .iter()
            .map(|name| (name.clone(), verify::EXACT_MATCH))
            .collect();
        writer.write_side_file(
            VERIFICATION_FILE,
            &tables::write_values("similarity", &verified_rows)?,
        )?;

        let mut failed = parsed.failed;
        for (name, score) in verification.rejected() {
            let reason = match score {
                Some(score) => format!("round-trip similarity {score}"),
                None => "similarity could not be computed".to_string(),
            };
            failed.insert(name.clone(), reason);
        }
        for name in &verification.unmatched {
            failed
                .entry(name.clone())
                .or_insert_with(|| "no round-trip structure".to_string());
        }
        let manifest = writer.commit(&verification.verified, failed)?;

        let reasons = failure_reasons(&manifest);
        ctx.registry.retain_active(&manifest.succeeded, |name| {
            if verification.scores.contains_key(name) {
                Exclusion::IdentityMismatch
            } else {
                Exclusion::ConversionFailed(reasons.get(name).cloned().unwrap_or_default())
            }
        });
        Ok(((), manifest))
    }

    fn plan_batches(
        &self,
        ctx: &mut RunContext<'_>,
    ) -> Result<(Vec<BatchManifest>, StageManifest), DockError> {
        let names = ctx.store.list_artifacts(StageId::DockingInput)?;
        let writer = ctx.store.create_stage(StageId::Batches, Overwrite::Reject)?;
        let manifests = batch::write_manifests(
            &writer,
            &names,
            &ctx.store.stage_dir(StageId::DockingInput),
            StageId::DockingInput.artifact_suffix(),
            self.config.batch_size,
        )?;
        let manifest = writer.commit_items(names, BTreeMap::new())?;
        info!(batches = manifests.len(), size = self.config.batch_size, "planned docking batches");
        Ok((manifests, manifest))
    }

    fn dock(
        &self,
        ctx: &mut RunContext<'_>,
        manifests: &[BatchManifest],
    ) -> Result<(Vec<usize>, StageManifest), DockError> {
        let writer = ctx.store.create_stage(StageId::Docked, Overwrite::Reject)?;
        let receptor = ctx.store.input_path(RECEPTOR_PDBQT);
        let docking_config = ctx.store.input_path(DOCKING_CONFIG);
        let job = DockingJob {
            receptor: &receptor,
            docking_config: &docking_config,
            output_dir: writer.path(),
            log_dir: writer.path(),
        };
        let docking = DockingTool::new(&self.process, &self.config.docking);

        let mut failed = BTreeMap::new();
        let mut failed_batches = Vec::new();
        for manifest in manifests {
            self.ensure_not_cancelled()?;
            if let BatchOutcome::Failed { code, log } = docking.dock_batch(manifest, &job)? {
                failed_batches.push(manifest.index);
                let log_name = log.file_name().unwrap_or_default();
                for name in &manifest.names {
                    failed.insert(
                        name.clone(),
                        format!(
                            "docking batch {} exited with {code:?}; see {}/{log_name}",
                            manifest.index,
                            StageId::Docked.dir_name()
                        ),
                    );
                }
            }
        }
        let produced = writer.list_artifacts()?;
        failed.retain(|name, _| produced.binary_search(name).is_err());

        let expected: Vec<CompoundName> = manifests
            .iter()
            .flat_map(|manifest| manifest.names.iter().cloned())
            .collect();
        let manifest = writer.commit(&expected, failed)?;
        drop_failed(&mut ctx.registry, &manifest, Exclusion::DockingFailed);
        if !failed_batches.is_empty() {
            warn!(failed = failed_batches.len(), total = manifests.len(), "docking batches failed");
        }
        Ok((failed_batches, manifest))
    }

    fn extract_scores(
        &self,
        ctx: &mut RunContext<'_>,
    ) -> Result<(Vec<(CompoundName, f64)>, StageManifest), DockError> {
        let items = artifact_items(ctx, StageId::Docked);
        let report = self.runner.run("extract scores", &items, |_, path| {
            ItemOutcome::from(
                read_text(path)
                    .and_then(|content| formats::parse_affinity(&content).map_err(DockError::MalformedArtifact)),
            )
        })?;
        let rows: Vec<(CompoundName, f64)> = report
            .succeeded
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .collect();

        let writer = ctx.store.create_stage(StageId::Scores, Overwrite::Reject)?;
        writer.write_side_file(AFFINITY_FILE, &tables::write_scores(&rows)?)?;
        let manifest = writer.commit_items(item_names(&rows), report.failed)?;

        let affinities = NamedTable::from_rows(rows.iter().cloned())?;
        ctx.registry
            .accrete(&affinities, |record, score| record.affinity = Some(*score));
        drop_failed(&mut ctx.registry, &manifest, Exclusion::ScoreMalformed);
        Ok((rows, manifest))
    }

    fn extract_first_pose(
        &self,
        ctx: &mut RunContext<'_>,
        source: StageId,
    ) -> Result<((), StageManifest), DockError> {
        let items = artifact_items(ctx, source);
        let writer = ctx.store.create_stage(StageId::FirstPose, Overwrite::Reject)?;
        let report = self.runner.run("extract first pose", &items, |name, path| {
            ItemOutcome::from(
                read_text(path)
                    .and_then(|content| {
                        formats::first_model(&content)
                            .map(str::to_string)
                            .map_err(DockError::MalformedArtifact)
                    })
                    .and_then(|pose| writer.write_artifact(name, pose.as_bytes())),
            )
        })?;
        let manifest = writer.commit(&item_names(&items), report.failed)?;
        drop_failed(&mut ctx.registry, &manifest, Exclusion::DockingFailed);
        Ok(((), manifest))
    }

    /// Writes `output.csv`: every row of the affinity table left-joined with
    /// its declared structure, best score first. Exclusions after scoring do
    /// not remove a compound from the report.
    fn write_ranked(
        &self,
        ctx: &mut RunContext<'_>,
        scores: &[(CompoundName, f64)],
    ) -> Result<Vec<SummaryRow>, DockError> {
        let scored = NamedTable::from_rows(scores.iter().cloned())?;
        let declared = NamedTable::from_rows(
            ctx.registry
                .records()
                .iter()
                .map(|(name, record)| (name.clone(), (record.smiles.clone(), record.heavy_atoms))),
        )?;

        let mut rows: Vec<SummaryRow> = scored
            .join(&declared, JoinKind::Left)
            .into_rows()
            .map(|(name, (score, declared))| {
                let (smiles, heavy_atoms) = match declared {
                    Some((smiles, heavy_atoms)) => (Some(smiles), heavy_atoms),
                    None => (None, None),
                };
                SummaryRow {
                    name,
                    smiles,
                    score,
                    efficiency: ligand_efficiency(score, heavy_atoms),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.name.cmp(&b.name)));

        let efficiencies = NamedTable::from_rows(
            rows.iter().map(|row| (row.name.clone(), row.efficiency)),
        )?;
        ctx.registry
            .accrete(&efficiencies, |record, efficiency| record.efficiency = *efficiency);
        ctx.store
            .write_root_file(RANKED_FILE, &tables::write_summary(&rows)?)?;
        ctx.save_registry()?;
        ctx.progress(format!("phase=Report; ranked={}", rows.len()));
        Ok(rows)
    }

    fn assemble_complexes(
        &self,
        ctx: &mut RunContext<'_>,
        ranked: &[SummaryRow],
    ) -> Result<(usize, StageManifest), DockError> {
        let receptor = read_text(&ctx.store.input_path(RECEPTOR_PDB))?;
        let poses = ctx.store.list_artifacts(StageId::FirstPose)?;
        let mut failed = BTreeMap::new();
        let mut items: Vec<(CompoundName, Utf8PathBuf)> = Vec::new();
        for row in ranked {
            if poses.binary_search(&row.name).is_ok() {
                items.push((
                    row.name.clone(),
                    ctx.store.artifact_path(StageId::FirstPose, &row.name),
                ));
            } else {
                failed.insert(row.name.clone(), "no first pose".to_string());
            }
        }
        let writer = ctx.store.create_stage(StageId::Complexes, Overwrite::Reject)?;
        let ligands = writer.create_subdir("ligands")?;
        let report = self.runner.run("assemble complexes", &items, |name, pose| {
            let ligand = ligands.join(format!("{name}.pdb"));
            ItemOutcome::from(
                self.chemistry
                    .convert_format(pose, &ligand)
                    .and_then(|()| read_text(&ligand))
                    .and_then(|pdb| {
                        formats::assemble_complex(&receptor, &pdb).map_err(DockError::MalformedArtifact)
                    })
                    .and_then(|complex| writer.write_artifact(name, complex.as_bytes())),
            )
        })?;
        let built = report.succeeded.len();
        failed.extend(report.failed);
        let manifest = writer.commit(&item_names(&items), failed)?;
        Ok((built, manifest))
    }

    fn check_validity(
        &self,
        ctx: &mut RunContext<'_>,
        selected: &[(CompoundName, f64)],
        ranked: Vec<SummaryRow>,
    ) -> Result<((Vec<SummaryRow>, Vec<SummaryRow>), StageManifest), DockError> {
        let writer = ctx.store.create_stage(StageId::Validity, Overwrite::Replace)?;
        let rows = if selected.is_empty() {
            debug!("no compounds in range; skipping validity script");
            Vec::new()
        } else {
            let raw = writer.path().join(VALIDITY_RAW_FILE);
            let scripts = ScriptRunner::new(&self.process, &self.config);
            let args = [
                ctx.store.stage_dir(StageId::ValidityInput).to_string(),
                ctx.store.input_path(RECEPTOR_PDB).to_string(),
                raw.to_string(),
            ];
            scripts.run(StageId::Validity, Script::ValidityFilter, &args, ctx.store.run_root())?;
            let content = fs::read(raw.as_std_path())
                .map_err(|err| DockError::Table(format!("validity table {raw}: {err}")))?;
            tables::parse_validity_table(&content)?
        };

        let wanted: BTreeSet<&CompoundName> = selected.iter().map(|(name, _)| name).collect();
        let rows: Vec<ValidityRow> = rows
            .into_iter()
            .filter(|row| wanted.contains(&row.name))
            .collect();
        writer.write_side_file(VALIDITY_FILE, &tables::write_validity(&rows)?)?;

        let pass_counts: BTreeMap<&CompoundName, u32> =
            rows.iter().map(|row| (&row.name, row.passes)).collect();
        let pass_threshold = self.config.validity_pass_threshold;
        let (passed, failed_rows): (Vec<SummaryRow>, Vec<SummaryRow>) = ranked
            .into_iter()
            .filter(|row| wanted.contains(&row.name))
            .partition(|row| pass_counts.get(&row.name).is_some_and(|count| *count >= pass_threshold));
        writer.write_side_file(WITH_VALIDITY_FILE, &tables::write_summary(&passed)?)?;
        writer.write_side_file(WITHOUT_VALIDITY_FILE, &tables::write_summary(&failed_rows)?)?;

        let checked: BTreeSet<&CompoundName> = rows.iter().map(|row| &row.name).collect();
        let failed: BTreeMap<CompoundName, String> = wanted
            .iter()
            .filter(|name| !checked.contains(*name))
            .map(|name| ((*name).clone(), "no validity result".to_string()))
            .collect();
        let manifest =
            writer.commit_items(rows.iter().map(|row| row.name.clone()).collect(), failed)?;

        let passes = NamedTable::from_rows(rows.iter().map(|row| (row.name.clone(), row.passes)))?;
        ctx.registry
            .accrete(&passes, |record, passes| record.validity_passes = Some(*passes));
        Ok(((passed, failed_rows), manifest))
    }
}

fn stage_failed(stage: StageId, err: DockError) -> DockError {
    match err {
        DockError::StageFailed { .. } | DockError::Cancelled => err,
        other => DockError::StageFailed {
            stage: stage.dir_name().to_string(),
            source: Box::new(other),
        },
    }
}

fn artifact_items(ctx: &RunContext<'_>, stage: StageId) -> Vec<(CompoundName, Utf8PathBuf)> {
    ctx.registry
        .active()
        .into_iter()
        .map(|name| {
            let path = ctx.store.artifact_path(stage, &name);
            (name, path)
        })
        .collect()
}

fn item_names<T>(items: &[(CompoundName, T)]) -> Vec<CompoundName> {
    items.iter().map(|(name, _)| name.clone()).collect()
}

fn failure_reasons(manifest: &StageManifest) -> BTreeMap<CompoundName, String> {
    manifest
        .failed
        .iter()
        .map(|item| (item.name.clone(), item.reason.clone()))
        .collect()
}

fn drop_failed(
    registry: &mut IdentityRegistry,
    manifest: &StageManifest,
    reason: impl Fn(String) -> Exclusion,
) -> usize {
    let reasons = failure_reasons(manifest);
    registry.retain_active(&manifest.succeeded, |name| {
        reason(
            reasons
                .get(name)
                .cloned()
                .unwrap_or_else(|| "no artifact produced".to_string()),
        )
    })
}

fn publish_stage_file(store: &Store, stage: StageId, file_name: &str) -> Result<Utf8PathBuf, DockError> {
    let content = store.read_stage_file(stage, file_name)?;
    store.write_root_file(file_name, &content)
}

fn read_text(path: &Utf8Path) -> Result<String, DockError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| DockError::Filesystem(format!("read {path}: {err}")))
}

/// Score per heavy atom, rounded to two decimals.
pub fn ligand_efficiency(score: f64, heavy_atoms: Option<u32>) -> Option<f64> {
    let heavy_atoms = heavy_atoms.filter(|count| *count > 0)?;
    Some((score / f64::from(heavy_atoms) * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efficiency_needs_positive_atom_count() {
        assert_eq!(ligand_efficiency(-7.5, Some(3)), Some(-2.5));
        assert_eq!(ligand_efficiency(-7.0, Some(3)), Some(-2.33));
        assert_eq!(ligand_efficiency(-7.0, Some(0)), None);
        assert_eq!(ligand_efficiency(-7.0, None), None);
    }

    #[test]
    fn stage_failure_is_wrapped_once() {
        let inner = stage_failed(StageId::Mol2, DockError::MissingTool("obabel".to_string()));
        let outer = stage_failed(StageId::Pdbqt, inner);
        assert!(matches!(&outer, DockError::StageFailed { stage, .. } if stage == "02_mol2"));
        assert!(matches!(
            stage_failed(StageId::Docked, DockError::Cancelled),
            DockError::Cancelled
        ));
    }
}
