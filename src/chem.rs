use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::domain::CompoundName;
use crate::error::DockError;
use crate::external::ProcessRunner;

static TANIMOTO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tanimoto from .*=\s*([0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)")
        .unwrap_or_else(|err| panic!("invalid Tanimoto pattern: {err}"))
});

pub trait SimilarityScorer: Send + Sync {
    fn similarity(&self, declared: &str, recovered: &str) -> Option<f64>;
}

pub trait Chemistry: SimilarityScorer {
    fn generate_3d(&self, name: &CompoundName, smiles: &str) -> Result<String, DockError>;

    fn heavy_atoms(&self, smiles: &str) -> Option<u32>;

    fn convert_format(&self, input: &Utf8Path, output: &Utf8Path) -> Result<(), DockError>;
}

pub struct ObabelChemistry<'a, P: ProcessRunner + ?Sized> {
    process: &'a P,
    executable: String,
    conformers: u32,
}

impl<'a, P: ProcessRunner + ?Sized> ObabelChemistry<'a, P> {
    pub fn new(process: &'a P, config: &ResolvedConfig) -> Self {
        Self {
            process,
            executable: config.obabel.clone(),
            conformers: config.conformers,
        }
    }

    fn obabel(&self, args: Vec<String>) -> Result<String, DockError> {
        let output = self.process.run(&self.executable, &args, None)?;
        if !output.success() {
            return Err(DockError::ChemistryTool(format!(
                "{} exited with {:?}: {}",
                self.executable,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl<P: ProcessRunner + ?Sized> SimilarityScorer for ObabelChemistry<'_, P> {
    fn similarity(&self, declared: &str, recovered: &str) -> Option<f64> {
        let stdout = self
            .obabel(vec![
                format!("-:{declared}"),
                format!("-:{recovered}"),
                "-ofpt".to_string(),
            ])
            .ok()?;
        let score = TANIMOTO
            .captures(&stdout)?
            .get(1)?
            .as_str()
            .parse::<f64>()
            .ok()?;
        Some(score.clamp(0.0, 1.0))
    }
}

impl<P: ProcessRunner + ?Sized> Chemistry for ObabelChemistry<'_, P> {
    fn generate_3d(&self, name: &CompoundName, smiles: &str) -> Result<String, DockError> {
        let mut args = vec![
            format!("-:{smiles}"),
            "-osdf".to_string(),
            "--gen3d".to_string(),
            "-h".to_string(),
            "--title".to_string(),
            name.to_string(),
        ];
        if self.conformers > 1 {
            args.extend([
                "--conformer".to_string(),
                "--nconf".to_string(),
                self.conformers.to_string(),
                "--score".to_string(),
                "energy".to_string(),
            ]);
        }
        let sdf = self.obabel(args)?;
        if !sdf.contains("$$$$") {
            return Err(DockError::ChemistryTool(format!(
                "no structure generated for {name}"
            )));
        }
        Ok(sdf)
    }

    fn heavy_atoms(&self, smiles: &str) -> Option<u32> {
        let stdout = self
            .obabel(vec![
                format!("-:{smiles}"),
                "-d".to_string(),
                "-otxt".to_string(),
                "--append".to_string(),
                "atoms".to_string(),
            ])
            .ok()?;
        let count = stdout.split_whitespace().last()?.parse::<u32>().ok();
        debug!(smiles, ?count, "counted heavy atoms");
        count
    }

    fn convert_format(&self, input: &Utf8Path, output: &Utf8Path) -> Result<(), DockError> {
        self.obabel(vec![input.to_string(), "-O".to_string(), output.to_string()])?;
        if !output.as_std_path().is_file() {
            return Err(DockError::ChemistryTool(format!(
                "conversion of {input} produced no output"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::external::ToolOutput;

    struct Canned {
        exit_code: i32,
        stdout: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ProcessRunner for Canned {
        fn run(
            &self,
            _program: &str,
            args: &[String],
            _cwd: Option<&Utf8Path>,
        ) -> Result<ToolOutput, DockError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(ToolOutput {
                exit_code: Some(self.exit_code),
                stdout: self.stdout.clone(),
                stderr: "Open Babel error".to_string(),
            })
        }
    }

    fn config() -> ResolvedConfig {
        let config = Config {
            scripts_dir: Some("scripts".to_string()),
            ..Config::default()
        };
        ConfigLoader::resolve_config(config, None).unwrap()
    }

    fn canned(stdout: &str) -> Canned {
        Canned {
            exit_code: 0,
            stdout: stdout.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn similarity_parses_tanimoto_line() {
        let process = canned(">agan1\n>agan1   Tanimoto from agan1 = 0.4\n");
        let chem = ObabelChemistry::new(&process, &config());
        assert_eq!(chem.similarity("CCO", "CCN"), Some(0.4));
    }

    #[test]
    fn similarity_without_fingerprint_is_null() {
        let process = canned("0 molecules converted\n");
        let chem = ObabelChemistry::new(&process, &config());
        assert_eq!(chem.similarity("CCO", "not a smiles"), None);
    }

    #[test]
    fn heavy_atoms_reads_appended_count() {
        let process = canned("agan1 3\n");
        let chem = ObabelChemistry::new(&process, &config());
        assert_eq!(chem.heavy_atoms("CCO"), Some(3));
        let calls = process.calls.lock().unwrap();
        assert_eq!(calls[0][0], "-:CCO");
        assert!(calls[0].contains(&"-d".to_string()));
    }

    #[test]
    fn generation_requests_energy_ranked_conformers() {
        let process = canned("agan1\n\n\n$$$$\n");
        let chem = ObabelChemistry::new(&process, &config());
        let name: CompoundName = "agan1".parse().unwrap();
        chem.generate_3d(&name, "CCO").unwrap();
        let calls = process.calls.lock().unwrap();
        assert!(calls[0].contains(&"--gen3d".to_string()));
        assert!(calls[0].contains(&"10".to_string()));
    }

    #[test]
    fn failed_conversion_is_a_tool_error() {
        let process = Canned {
            exit_code: 1,
            ..canned("")
        };
        let chem = ObabelChemistry::new(&process, &config());
        let err = chem
            .convert_format(Utf8Path::new("pose.pdbqt"), Utf8Path::new("pose.pdb"))
            .unwrap_err();
        assert!(matches!(err, DockError::ChemistryTool(_)));
        assert!(!err.is_input_contract());
    }
}
