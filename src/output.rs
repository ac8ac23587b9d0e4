use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::pipeline::{FilterResult, ProfileResult, ProgressEvent, ProgressSink, RunResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_filter(result: &FilterResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_profile(result: &ProfileResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_run(result: &RunResult) {
        println!("run root: {}", result.run_root);
        println!(
            "compounds: {} (salts: {}, docked: {}, ranked: {})",
            result.compounds, result.salts, result.docked, result.ranked
        );
        println!(
            "batches: {} (failed: {})",
            result.batches,
            result.failed_batches.len()
        );
        for (reason, count) in &result.excluded {
            println!("  excluded {reason}: {count}");
        }
        println!("ranked output: {}", result.output);
    }

    pub fn print_filter(result: &FilterResult) {
        println!("run root: {}", result.run_root);
        println!(
            "in range: {} (passed: {}, failed: {})",
            result.selected,
            result.passed.len(),
            result.failed.len()
        );
        println!("with validity: {}", result.with_validity);
        println!("without validity: {}", result.without_validity);
    }

    pub fn print_profile(result: &ProfileResult) {
        println!("run root: {}", result.run_root);
        println!("in range: {}, profiled: {}", result.selected, result.profiled.len());
        if !result.missing.is_empty() {
            println!("no complex: {}", result.missing.join(", "));
        }
    }
}
