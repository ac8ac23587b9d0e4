use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use agandock::chem::ObabelChemistry;
use agandock::config::{ConfigLoader, ResolvedConfig};
use agandock::error::DockError;
use agandock::external::{SystemProcessRunner, require_tool};
use agandock::output::{JsonOutput, OutputMode, TextOutput, TracingProgress};
use agandock::pipeline::{CompoundSource, Pipeline, ProgressSink, RunRequest, ScoreRange};

#[derive(Parser)]
#[command(name = "agandock")]
#[command(about = "Staged virtual screening: 3D structures, verified format round trip, batched docking and score filtering")]
#[command(version, author)]
struct Cli {
    /// Print the result as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full pipeline into a new run root")]
    Run(RunArgs),
    #[command(about = "Re-run range extraction and the validity check on an existing run")]
    Filter(RangeArgs),
    #[command(about = "Profile interactions of ranked compounds within a score range")]
    Profile(RangeArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,

    /// Directory holding the conversion scripts.
    #[arg(long)]
    scripts_dir: Option<String>,
}

#[derive(Args)]
#[command(group = clap::ArgGroup::new("compounds").required(true))]
struct RunArgs {
    /// CSV table with a SMILES column and an optional Name column.
    #[arg(long, group = "compounds")]
    input: Option<Utf8PathBuf>,

    /// A single SMILES string, named agan1.
    #[arg(long, group = "compounds")]
    smiles: Option<String>,

    #[arg(long)]
    receptor_pdb: Utf8PathBuf,

    #[arg(long)]
    receptor_pdbqt: Utf8PathBuf,

    #[arg(long)]
    docking_config: Utf8PathBuf,

    #[arg(long, default_value = ".")]
    output: Utf8PathBuf,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct RangeArgs {
    run_root: Utf8PathBuf,

    #[arg(long, allow_negative_numbers = true)]
    low: f64,

    #[arg(long, allow_negative_numbers = true)]
    high: f64,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DockError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DockError) -> u8 {
    if error.is_input_contract() {
        return 2;
    }
    if let Some(code) = error.external_exit_code() {
        return code.clamp(1, 255) as u8;
    }
    match error {
        DockError::ConfigRead(_)
        | DockError::ConfigParse(_)
        | DockError::MissingScriptsDir => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, output_mode),
        Commands::Filter(args) => run_filter(args, output_mode),
        Commands::Profile(args) => run_profile(args, output_mode),
    }
}

fn resolve_config(args: &ConfigArgs) -> Result<ResolvedConfig, DockError> {
    ConfigLoader::resolve(args.config.as_deref(), args.scripts_dir.as_deref())
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TracingProgress,
    }
}

fn run_pipeline(args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve_config(&args.config)?;
    require_tool(&config.shell)?;
    require_tool(&config.obabel)?;
    require_tool(&config.docking.executable)?;

    let compounds = match (args.input, args.smiles) {
        (Some(path), _) => CompoundSource::Table(path),
        (None, Some(smiles)) => CompoundSource::Smiles(smiles),
        (None, None) => return Err(DockError::MalformedInput("no compounds given".to_string()).into()),
    };
    let request = RunRequest {
        compounds,
        receptor_pdb: args.receptor_pdb,
        receptor_pdbqt: args.receptor_pdbqt,
        docking_config: args.docking_config,
        output_dir: args.output,
    };

    let process = SystemProcessRunner;
    let chemistry = ObabelChemistry::new(&process, &config);
    let pipeline = Pipeline::new(config, chemistry, SystemProcessRunner)?;
    let result = pipeline.run(&request, sink(output_mode))?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_run(&result),
    }
    Ok(())
}

fn run_filter(args: RangeArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve_config(&args.config)?;
    require_tool(&config.shell)?;

    let process = SystemProcessRunner;
    let chemistry = ObabelChemistry::new(&process, &config);
    let pipeline = Pipeline::new(config, chemistry, SystemProcessRunner)?;
    let range = ScoreRange {
        low: args.low,
        high: args.high,
    };
    let result = pipeline.filter(&args.run_root, range, sink(output_mode))?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_filter(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_filter(&result),
    }
    Ok(())
}

fn run_profile(args: RangeArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve_config(&args.config)?;
    require_tool(&config.profiler.executable)?;

    let process = SystemProcessRunner;
    let chemistry = ObabelChemistry::new(&process, &config);
    let pipeline = Pipeline::new(config, chemistry, SystemProcessRunner)?;
    let range = ScoreRange {
        low: args.low,
        high: args.high,
    };
    let result = pipeline.profile(&args.run_root, range, sink(output_mode))?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_profile(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_profile(&result),
    }
    Ok(())
}
