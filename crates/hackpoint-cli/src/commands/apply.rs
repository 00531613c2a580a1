//! Apply command implementation.

use std::path::Path;

use anyhow::Result;
use hackpoint_core::{ApplyReport, Engine, StageReport, SymbolPolicy};
use serde_json::json;

use super::hex_utils::format_hex_address;
use super::target::{build_engine, build_memory, load_config, register_stub_handlers};
use crate::TargetArgs;
use crate::prompter::CliPrompter;

/// Apply the configuration at `path` to a fresh simulated target
pub fn apply_config(
    path: &Path,
    stub_handlers: bool,
    policy: SymbolPolicy,
    target: &TargetArgs,
) -> Result<(Engine, ApplyReport)> {
    let memory = build_memory(target)?;
    let config = load_config(Some(path))?;

    let mut engine = build_engine(&memory, target);
    engine.set_symbol_policy(policy);
    engine.set_prompter(CliPrompter);
    if stub_handlers {
        register_stub_handlers(&mut engine, &config);
    }
    let report = engine.apply(&config)?;
    Ok((engine, report))
}

fn print_stage(name: &str, stage: &StageReport) {
    println!(
        "  {:<12} {:>3} total, {:>3} applied, {:>3} failed, {:>3} ignored",
        name, stage.total, stage.applied, stage.failed, stage.ignored
    );
}

/// Run the apply command
pub fn run(
    path: &Path,
    stub_handlers: bool,
    policy: SymbolPolicy,
    json: bool,
    target: &TargetArgs,
) -> Result<()> {
    let (engine, report) = apply_config(path, stub_handlers, policy, target)?;

    if json {
        let sites: Vec<_> = engine
            .breakpoints()
            .iter()
            .flat_map(|batch| batch.sites.iter())
            .collect();
        let output = json!({
            "report": report,
            "codecaves": engine.caves(),
            "breakpoints": sites,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Result:");
    print_stage("codecaves", &report.codecaves);
    print_stage("binhacks", &report.binhacks);
    print_stage("breakpoints", &report.breakpoints);

    if !engine.caves().is_empty() {
        println!();
        println!("Code caves:");
        for cave in engine.caves() {
            println!(
                "  {} {} ({} bytes, {} reserved)",
                format_hex_address(cave.address),
                cave.name,
                cave.size,
                cave.padded
            );
        }
    }

    let sites: Vec<_> = engine
        .breakpoints()
        .iter()
        .flat_map(|batch| batch.sites.iter())
        .collect();
    if !sites.is_empty() {
        println!();
        println!("Breakpoints:");
        for site in sites {
            let slot = site
                .slot
                .map(format_hex_address)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {} slot {} {}",
                format_hex_address(site.address),
                site.name,
                slot,
                site.state
            );
        }
    }

    if report.failed() > 0 {
        println!();
        println!("{} hackpoints failed, see the log above", report.failed());
    }
    Ok(())
}
