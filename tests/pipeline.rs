use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use agandock::chem::{Chemistry, SimilarityScorer};
use agandock::config::{DockingSettings, ProfilerSettings, ResolvedConfig};
use agandock::domain::{CompoundName, StageId, ThresholdSpec};
use agandock::error::DockError;
use agandock::external::{ProcessRunner, Script, ToolOutput};
use agandock::ledger::{RunLedger, StageState};
use agandock::output::JsonOutput;
use agandock::pipeline::{CompoundSource, Pipeline, RunRequest, ScoreRange};
use agandock::registry::{Exclusion, RegistryRow};
use agandock::store::{Store, read_json};

const RECEPTOR: &str = "ATOM      1  N   ALA A   1      11.104  13.207   2.100  1.00  0.00           N\nEND\n";

struct MockChemistry {
    lossy: BTreeSet<String>,
}

impl SimilarityScorer for MockChemistry {
    fn similarity(&self, declared: &str, recovered: &str) -> Option<f64> {
        if self.lossy.contains(declared) {
            Some(0.4)
        } else if declared == recovered {
            Some(1.0)
        } else {
            Some(0.0)
        }
    }
}

impl Chemistry for MockChemistry {
    fn generate_3d(&self, name: &CompoundName, smiles: &str) -> Result<String, DockError> {
        Ok(format!("{name}\nSMILES:{smiles}\n$$$$\n"))
    }

    fn heavy_atoms(&self, smiles: &str) -> Option<u32> {
        Some(smiles.chars().filter(char::is_ascii_uppercase).count() as u32)
    }

    fn convert_format(&self, input: &Utf8Path, output: &Utf8Path) -> Result<(), DockError> {
        fs::read_to_string(input.as_std_path()).map_err(|err| DockError::Filesystem(err.to_string()))?;
        fs::write(
            output.as_std_path(),
            "ATOM      1  C1  LIG     1       0.000   0.000   0.000  1.00  0.00           C\nEND\n",
        )
        .map_err(|err| DockError::Filesystem(err.to_string()))
    }
}

#[derive(Default)]
struct MockTools {
    scores: BTreeMap<String, f64>,
    failing_docking: BTreeSet<String>,
    invalid: BTreeSet<String>,
    unconverted_sdf: BTreeSet<String>,
    fail_script: Option<(&'static str, i32)>,
    calls: Mutex<Vec<String>>,
}

impl ProcessRunner for MockTools {
    fn run(&self, program: &str, args: &[String], _cwd: Option<&Utf8Path>) -> Result<ToolOutput, DockError> {
        self.calls.lock().unwrap().push(program.to_string());
        match program {
            "bash" => Ok(self.script(args)),
            "unidock" => Ok(self.dock(args)),
            "plip" => Ok(self.profile(args)),
            other => Err(DockError::MissingTool(other.to_string())),
        }
    }
}

impl MockTools {
    fn script(&self, args: &[String]) -> ToolOutput {
        let script = Utf8Path::new(&args[0]).file_name().unwrap();
        if let Some((failing, code)) = self.fail_script {
            if failing == script {
                return output(Some(code), "conversion crashed");
            }
        }
        let input = Utf8Path::new(&args[1]);
        match script {
            "1_sdf_to_mol2.sh" => convert(input, &args[2], ".sdf", ".mol2", |stem, content| {
                format!(
                    "@<TRIPOS>MOLECULE\n{stem}\n@<TRIPOS>ATOM\n      1 C          0.0000    0.0000    0.0000 C.3     1  LIG1        0.0000\n@<TRIPOS>BOND\nSMILES:{}\n",
                    smiles_of(content)
                )
            }),
            "2_mol2_to_pdbqt.sh" => convert(input, &args[2], ".mol2", ".pdbqt", |_, content| content.to_string()),
            "3_pdbqt_to_smiles.sh" => convert(input, &args[2], ".pdbqt", ".smi", |stem, content| {
                format!("{}\t{stem}\n", smiles_of(content))
            }),
            "4_pdbqt_to_sdf.sh" => {
                let result = convert(input, &args[2], ".pdbqt", ".sdf", |stem, _| format!("{stem}\n$$$$\n"));
                for name in &self.unconverted_sdf {
                    fs::remove_file(Utf8Path::new(&args[2]).join(format!("{name}_out.sdf"))).unwrap();
                }
                result
            }
            "5_posebusters_filter.sh" => {
                let mut table = String::from("file,molecule,sanitization,clashes\n");
                for stem in stems(input, ".sdf") {
                    let name = stem.trim_end_matches("_out");
                    let cell = if self.invalid.contains(name) { "False" } else { "True" };
                    table.push_str(&format!("{input}/{stem}.sdf,{stem},True,{cell}\n"));
                }
                fs::write(&args[3], table).unwrap();
                output(Some(0), "")
            }
            other => panic!("unexpected script {other}"),
        }
    }

    fn dock(&self, args: &[String]) -> ToolOutput {
        let start = args.iter().position(|arg| arg == "--gpu_batch").unwrap() + 1;
        let ligands: Vec<&String> = args[start..].iter().take_while(|arg| !arg.starts_with("--")).collect();
        let dir_idx = args.iter().position(|arg| arg == "--dir").unwrap() + 1;
        let out_dir = Utf8Path::new(&args[dir_idx]);

        let stems: Vec<String> = ligands
            .iter()
            .map(|path| Utf8Path::new(path.as_str()).file_stem().unwrap().to_string())
            .collect();
        if stems.iter().any(|stem| self.failing_docking.contains(stem)) {
            return output(Some(1), "CUDA error: out of memory");
        }
        for stem in stems {
            let score = self.scores.get(&stem).copied().unwrap_or(-7.5);
            let pose = format!(
                "MODEL 1\nREMARK VINA RESULT:    {score}      0.000      0.000\nATOM      1  C1  LIG     1       0.000   0.000   0.000  1.00  0.00     0.000 C\nENDMDL\nMODEL 2\nREMARK VINA RESULT:    -1.0      2.000      3.000\nENDMDL\n"
            );
            fs::write(out_dir.join(format!("{stem}_out.pdbqt")), pose).unwrap();
        }
        output(Some(0), "docked")
    }

    fn profile(&self, args: &[String]) -> ToolOutput {
        let out_idx = args.iter().position(|arg| arg == "-o").unwrap() + 1;
        fs::write(Utf8Path::new(&args[out_idx]).join("report.xml"), "<report/>").unwrap();
        output(Some(0), "")
    }
}

fn output(code: Option<i32>, stderr: &str) -> ToolOutput {
    ToolOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn smiles_of(content: &str) -> String {
    content
        .lines()
        .find_map(|line| line.strip_prefix("SMILES:"))
        .unwrap_or_default()
        .to_string()
}

fn stems(dir: &Utf8Path, suffix: &str) -> Vec<String> {
    let mut stems: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter_map(|file| file.strip_suffix(suffix).map(str::to_string))
        .collect();
    stems.sort();
    stems
}

fn convert(
    input: &Utf8Path,
    output_dir: &str,
    from: &str,
    to: &str,
    transform: impl Fn(&str, &str) -> String,
) -> ToolOutput {
    for stem in stems(input, from) {
        let content = fs::read_to_string(input.join(format!("{stem}{from}"))).unwrap();
        fs::write(
            Utf8Path::new(output_dir).join(format!("{stem}{to}")),
            transform(&stem, &content),
        )
        .unwrap();
    }
    output(Some(0), "")
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new(smiles: &[&str]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let scripts = root.join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        for script in [
            Script::SdfToMol2,
            Script::Mol2ToPdbqt,
            Script::PdbqtToSmiles,
            Script::PdbqtToSdf,
            Script::ValidityFilter,
        ] {
            fs::write(scripts.join(script.file_name()), "#!/bin/bash\n").unwrap();
        }
        fs::write(root.join("receptor.pdb"), RECEPTOR).unwrap();
        fs::write(root.join("receptor.pdbqt"), RECEPTOR).unwrap();
        fs::write(root.join("config.txt"), "center_x = 0\n").unwrap();
        let mut table = String::from("SMILES\n");
        for value in smiles {
            table.push_str(value);
            table.push('\n');
        }
        fs::write(root.join("ligands.csv"), table).unwrap();
        Self { _temp: temp, root }
    }

    fn config(&self, batch_size: usize) -> ResolvedConfig {
        ResolvedConfig {
            scripts_dir: self.root.join("scripts"),
            shell: "bash".to_string(),
            obabel: "obabel".to_string(),
            docking: DockingSettings {
                executable: "unidock".to_string(),
                search_mode: "detail".to_string(),
                scoring: "vina".to_string(),
            },
            profiler: ProfilerSettings {
                executable: "plip".to_string(),
                args: vec!["-yvxt".to_string()],
            },
            batch_size,
            max_heavy_atoms: 50,
            conformers: 1,
            workers: Some(2),
            validity_pass_threshold: 2,
            candidate_threshold: None,
        }
    }

    fn request(&self) -> RunRequest {
        RunRequest {
            compounds: CompoundSource::Table(self.root.join("ligands.csv")),
            receptor_pdb: self.root.join("receptor.pdb"),
            receptor_pdbqt: self.root.join("receptor.pdbqt"),
            docking_config: self.root.join("config.txt"),
            output_dir: self.root.join("out"),
        }
    }

    fn only_run_root(&self) -> Utf8PathBuf {
        let entries: Vec<_> = fs::read_dir(self.root.join("out")).unwrap().collect();
        assert_eq!(entries.len(), 1);
        Utf8PathBuf::from_path_buf(entries.into_iter().next().unwrap().unwrap().path()).unwrap()
    }
}

fn name(value: &str) -> CompoundName {
    value.parse().unwrap()
}

fn scored_tools(scores: &[(&str, f64)]) -> MockTools {
    MockTools {
        scores: scores
            .iter()
            .map(|(name, score)| (name.to_string(), *score))
            .collect(),
        ..MockTools::default()
    }
}

fn chemistry(lossy: &[&str]) -> MockChemistry {
    MockChemistry {
        lossy: lossy.iter().map(|value| value.to_string()).collect(),
    }
}

#[test]
fn only_verified_compounds_reach_docking() {
    let fixture = Fixture::new(&["CCO", "CCN", "CC.Cl"]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&["CCN"]), MockTools::default()).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.compounds, 3);
    assert_eq!(result.salts, 1);
    assert_eq!(result.batches, 1);
    assert_eq!(result.docked, 1);
    assert_eq!(result.ranked, 1);
    assert_eq!(result.excluded.get("salt"), Some(&1));
    assert_eq!(result.excluded.get("identity_mismatch"), Some(&1));

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    assert_eq!(store.list_artifacts(StageId::DockingInput).unwrap(), vec![name("agan1")]);
    let batch = fs::read_to_string(store.stage_dir(StageId::Batches).join("batch_1.txt")).unwrap();
    assert_eq!(batch.lines().count(), 1);
    assert!(batch.trim_end().ends_with("06_pdbqt_for_docking/agan1.pdbqt"));

    let salted = fs::read_to_string(store.root_file("salted_compounds.csv")).unwrap();
    assert!(salted.contains("agan3,CC.Cl"));

    let ranked = fs::read_to_string(store.root_file("output.csv")).unwrap();
    assert_eq!(ranked, "name,smiles,score,efficiency\nagan1,CCO,-7.50,-2.50\n");

    let complex = fs::read_to_string(store.artifact_path(StageId::Complexes, &name("agan1"))).unwrap();
    assert!(complex.starts_with("ATOM      1  N   ALA"));
    assert!(complex.contains("HETATM    1  C1  LIG"));

    let ledger = RunLedger::load(&store).unwrap();
    assert_eq!(ledger.state(StageId::Complexes), StageState::Committed);
    assert_eq!(ledger.state(StageId::Candidates), StageState::Pending);

    let registry: Vec<RegistryRow> = read_json(&store.root_file("registry.json")).unwrap();
    assert_eq!(registry.len(), 3);
    let agan2 = registry.iter().find(|row| row.name == name("agan2")).unwrap();
    assert_eq!(agan2.record.excluded, Some(Exclusion::IdentityMismatch));
    assert_eq!(agan2.record.similarity, Some(0.4));
    let agan1 = registry.iter().find(|row| row.name == name("agan1")).unwrap();
    assert_eq!(agan1.record.affinity, Some(-7.5));
    assert_eq!(agan1.record.identity_verified, Some(true));
}

#[test]
fn failed_docking_batch_only_drops_its_compounds() {
    let fixture = Fixture::new(&["CCO", "CCN", "CCC"]);
    let tools = MockTools {
        failing_docking: BTreeSet::from(["agan2".to_string()]),
        ..MockTools::default()
    };
    let pipeline = Pipeline::new(fixture.config(1), chemistry(&[]), tools).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.batches, 3);
    assert_eq!(result.failed_batches, vec![2]);
    assert_eq!(result.docked, 2);
    assert_eq!(result.excluded.get("docking_failed"), Some(&1));

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    let manifest = store.read_manifest(StageId::Docked).unwrap();
    assert_eq!(manifest.succeeded, vec![name("agan1"), name("agan3")]);
    assert_eq!(manifest.failed.len(), 1);
    assert!(manifest.failed[0].reason.contains("unidock_output_batch_2.txt"));
    let log = fs::read_to_string(store.stage_dir(StageId::Docked).join("unidock_output_batch_2.txt")).unwrap();
    assert!(log.contains("out of memory"));
}

#[test]
fn failing_script_halts_run_and_names_stage() {
    let fixture = Fixture::new(&["CCO"]);
    let tools = MockTools {
        fail_script: Some(("2_mol2_to_pdbqt.sh", 3)),
        ..MockTools::default()
    };
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), tools).unwrap();

    let err = pipeline.run(&fixture.request(), &JsonOutput).unwrap_err();
    assert_eq!(err.external_exit_code(), Some(3));
    assert_matches!(&err, DockError::StageFailed { stage, source } if stage == "04_pdbqt" && matches!(**source, DockError::ExternalTool { .. }));

    let store = Store::open(&fixture.only_run_root()).unwrap();
    let ledger = RunLedger::load(&store).unwrap();
    assert_eq!(ledger.state(StageId::Mol2Renumbered), StageState::Committed);
    assert_eq!(ledger.state(StageId::Pdbqt), StageState::Failed);
    assert_eq!(ledger.state(StageId::RoundTrip), StageState::Pending);
    assert!(!store.is_committed(StageId::Pdbqt));
}

#[test]
fn missing_receptor_creates_no_run_root() {
    let fixture = Fixture::new(&["CCO"]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), MockTools::default()).unwrap();
    let mut request = fixture.request();
    request.receptor_pdb = fixture.root.join("absent.pdb");

    let err = pipeline.run(&request, &JsonOutput).unwrap_err();
    assert_matches!(err, DockError::MalformedInput(_));
    assert!(!fixture.root.join("out").exists());
}

#[test]
fn candidate_threshold_excludes_weak_binders() {
    let fixture = Fixture::new(&["CCO", "CCN"]);
    let mut config = fixture.config(10);
    config.candidate_threshold = Some(ThresholdSpec::Static { value: -7.0 });
    let tools = scored_tools(&[("agan1", -8.0), ("agan2", -6.0)]);
    let pipeline = Pipeline::new(config, chemistry(&[]), tools).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.docked, 2);
    assert_eq!(result.ranked, 2);
    assert_eq!(result.complexes, 1);
    assert_eq!(result.excluded.get("below_threshold"), Some(&1));

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    assert_eq!(store.list_artifacts(StageId::Candidates).unwrap(), vec![name("agan1")]);
    assert_eq!(store.list_artifacts(StageId::FirstPose).unwrap(), vec![name("agan1")]);
    let complexes = store.read_manifest(StageId::Complexes).unwrap();
    assert_eq!(complexes.succeeded, vec![name("agan1")]);
    assert_eq!(complexes.failed[0].name, name("agan2"));
    assert_eq!(complexes.failed[0].reason, "no first pose");
}

#[test]
fn ranked_report_keeps_compounds_lost_after_scoring() {
    let fixture = Fixture::new(&["CCO", "CCN"]);
    let mut tools = scored_tools(&[("agan1", -8.0), ("agan2", -6.0)]);
    tools.unconverted_sdf.insert("agan2".to_string());
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), tools).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.ranked, 2);
    assert_eq!(result.excluded.get("conversion_failed"), Some(&1));

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    let affinity = fs::read_to_string(store.stage_dir(StageId::Scores).join("affinity.csv")).unwrap();
    assert!(affinity.contains("agan2"));
    let ranked = fs::read_to_string(store.root_file("output.csv")).unwrap();
    assert_eq!(
        ranked,
        "name,smiles,score,efficiency\nagan1,CCO,-8.00,-2.67\nagan2,CCN,-6.00,-2.00\n"
    );
    assert_eq!(store.list_artifacts(StageId::DockedSdf).unwrap(), vec![name("agan1")]);

    let wide = ScoreRange { low: -9.0, high: -5.0 };
    let filtered = pipeline
        .filter(Utf8Path::new(&result.run_root), wide, &JsonOutput)
        .unwrap();
    assert_eq!(filtered.selected, 1);
    assert_eq!(filtered.passed, vec!["agan1".to_string()]);
}

#[test]
fn names_with_inner_spaces_flow_through_every_stage() {
    let fixture = Fixture::new(&[]);
    fs::write(fixture.root.join("ligands.csv"), "Name,SMILES\nAspirin analog 1,CCO\n").unwrap();
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), MockTools::default()).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.ranked, 1);
    assert_eq!(result.complexes, 1);

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    let ranked = fs::read_to_string(store.root_file("output.csv")).unwrap();
    assert!(ranked.contains("Aspirin analog 1,CCO,-7.50"));
    assert!(store.artifact_path(StageId::Complexes, &name("Aspirin analog 1")).exists());
}

#[test]
fn all_salt_input_finishes_with_empty_report() {
    let fixture = Fixture::new(&["CC.Cl", "CO.Na"]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), MockTools::default()).unwrap();

    let result = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    assert_eq!(result.salts, 2);
    assert_eq!(result.batches, 0);
    assert_eq!(result.ranked, 0);
    assert_eq!(result.complexes, 0);

    let store = Store::open(Utf8Path::new(&result.run_root)).unwrap();
    let ranked = fs::read_to_string(store.root_file("output.csv")).unwrap();
    assert_eq!(ranked, "name,smiles,score,efficiency\n");
    assert!(store.is_committed(StageId::Complexes));
    assert_eq!(RunLedger::load(&store).unwrap().state(StageId::Complexes), StageState::Committed);

    let range = ScoreRange { low: -20.0, high: 0.0 };
    let filtered = pipeline
        .filter(Utf8Path::new(&result.run_root), range, &JsonOutput)
        .unwrap();
    assert_eq!(filtered.selected, 0);
}

#[test]
fn failed_validity_rerun_leaves_no_stale_outputs() {
    let fixture = Fixture::new(&["CCO", "CCN"]);
    let tools = scored_tools(&[("agan1", -8.0), ("agan2", -6.0)]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), tools).unwrap();
    let run = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    let run_root = Utf8PathBuf::from(&run.run_root);
    pipeline
        .filter(&run_root, ScoreRange { low: -9.0, high: -5.0 }, &JsonOutput)
        .unwrap();

    let store = Store::open(&run_root).unwrap();
    assert!(store.root_file("output_with_validity.csv").exists());

    let crashing = MockTools {
        fail_script: Some(("5_posebusters_filter.sh", 4)),
        ..MockTools::default()
    };
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), crashing).unwrap();
    let err = pipeline
        .filter(&run_root, ScoreRange { low: -9.0, high: -7.0 }, &JsonOutput)
        .unwrap_err();
    assert_eq!(err.external_exit_code(), Some(4));

    assert!(!store.root_file("output_with_validity.csv").exists());
    assert!(!store.root_file("output_without_validity.csv").exists());
    assert!(!store.is_committed(StageId::Validity));
    assert_eq!(store.list_artifacts(StageId::ValidityInput).unwrap(), vec![name("agan1")]);
    assert_eq!(RunLedger::load(&store).unwrap().state(StageId::Validity), StageState::Failed);
}

#[test]
fn filter_rerun_replaces_only_rerunnable_stages() {
    let fixture = Fixture::new(&["CCO", "CCN", "CCC"]);
    let mut tools = scored_tools(&[("agan1", -8.0), ("agan2", -6.0), ("agan3", -4.0)]);
    tools.invalid.insert("agan2".to_string());
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), tools).unwrap();
    let run = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    let run_root = Utf8PathBuf::from(&run.run_root);

    let store = Store::open(&run_root).unwrap();
    let docked_before = fs::read(store.stage_dir(StageId::Docked).join("manifest.json")).unwrap();

    let wide = ScoreRange { low: -9.0, high: -5.0 };
    let result = pipeline.filter(&run_root, wide, &JsonOutput).unwrap();
    assert_eq!(result.selected, 2);
    assert_eq!(result.passed, vec!["agan1".to_string()]);
    assert_eq!(result.failed, vec!["agan2".to_string()]);
    assert_eq!(
        store.list_artifacts(StageId::ValidityInput).unwrap(),
        vec![name("agan1"), name("agan2")]
    );

    let narrow = ScoreRange { low: -9.0, high: -7.0 };
    let result = pipeline.filter(&run_root, narrow, &JsonOutput).unwrap();
    assert_eq!(result.selected, 1);
    assert!(result.failed.is_empty());
    assert_eq!(store.list_artifacts(StageId::ValidityInput).unwrap(), vec![name("agan1")]);

    let docked_after = fs::read(store.stage_dir(StageId::Docked).join("manifest.json")).unwrap();
    assert_eq!(docked_before, docked_after);
    let with_validity = fs::read_to_string(store.root_file("output_with_validity.csv")).unwrap();
    assert!(with_validity.contains("agan1,CCO,-8.00"));
    let without_validity = fs::read_to_string(store.root_file("output_without_validity.csv")).unwrap();
    assert_eq!(without_validity, "name,smiles,score,efficiency\n");

    let ledger = RunLedger::load(&store).unwrap();
    assert_eq!(ledger.state(StageId::Validity), StageState::Committed);
    assert_eq!(ledger.running(), None);
}

#[test]
fn empty_range_skips_validity_script() {
    let fixture = Fixture::new(&["CCO"]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), MockTools::default()).unwrap();
    let run = pipeline.run(&fixture.request(), &JsonOutput).unwrap();

    let range = ScoreRange { low: -20.0, high: -15.0 };
    let result = pipeline
        .filter(Utf8Path::new(&run.run_root), range, &JsonOutput)
        .unwrap();
    assert_eq!(result.selected, 0);
    assert!(result.passed.is_empty());

    let store = Store::open(Utf8Path::new(&run.run_root)).unwrap();
    assert!(store.is_committed(StageId::Validity));
    assert!(!store.stage_dir(StageId::Validity).join("validity_raw.csv").exists());
}

#[test]
fn inverted_range_is_rejected_before_touching_run() {
    let fixture = Fixture::new(&["CCO"]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), MockTools::default()).unwrap();
    let run = pipeline.run(&fixture.request(), &JsonOutput).unwrap();

    let range = ScoreRange { low: -5.0, high: -9.0 };
    let err = pipeline
        .filter(Utf8Path::new(&run.run_root), range, &JsonOutput)
        .unwrap_err();
    assert_matches!(err, DockError::InvalidThreshold(_));
    let store = Store::open(Utf8Path::new(&run.run_root)).unwrap();
    assert!(!store.is_committed(StageId::ValidityInput));
}

#[test]
fn profile_runs_once_per_selected_complex() {
    let fixture = Fixture::new(&["CCO", "CCN"]);
    let tools = scored_tools(&[("agan1", -8.0), ("agan2", -6.0)]);
    let pipeline = Pipeline::new(fixture.config(10), chemistry(&[]), tools).unwrap();
    let run = pipeline.run(&fixture.request(), &JsonOutput).unwrap();
    let run_root = Utf8PathBuf::from(&run.run_root);

    let range = ScoreRange { low: -9.0, high: -7.0 };
    let result = pipeline.profile(&run_root, range, &JsonOutput).unwrap();
    assert_eq!(result.selected, 1);
    assert_eq!(result.profiled, vec!["agan1".to_string()]);
    assert!(result.missing.is_empty());

    let store = Store::open(&run_root).unwrap();
    let report = store.stage_dir(StageId::Interactions).join("agan1").join("report.xml");
    assert!(report.exists());
    let manifest = store.read_manifest(StageId::Interactions).unwrap();
    assert_eq!(manifest.succeeded, vec![name("agan1")]);
}
