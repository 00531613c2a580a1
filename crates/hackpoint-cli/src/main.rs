mod commands;
mod prompter;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hackpoint_core::SymbolPolicy;
use tracing_subscriber::EnvFilter;

use commands::hex_utils::{parse_assignment, parse_hex_address};

#[derive(Parser)]
#[command(name = "hackpoint")]
#[command(about = "Dry-run and inspect hackpoint configurations", long_about = None)]
struct Cli {
    /// Log every write and lookup
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Simulated process the configuration is applied to
#[derive(Args)]
pub struct TargetArgs {
    /// Raw image mapped at the module base (a NOP-filled image if omitted)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Module base for `Rx` addresses
    #[arg(long, default_value = "0x400000", value_parser = parse_hex_address)]
    base: u32,

    /// Size of the blank image used without --image
    #[arg(long, default_value = "0x10000", value_parser = parse_hex_address)]
    image_size: u32,

    /// Named address, as `name=0x1234` (repeatable)
    #[arg(short, long = "symbol", value_parser = parse_assignment)]
    symbols: Vec<(String, u32)>,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate an expression
    Eval {
        expression: String,

        /// Register value, as `eax=0x10` (repeatable); enables `[...]` dereferences
        #[arg(short, long = "reg", value_parser = parse_assignment)]
        regs: Vec<(String, u32)>,

        /// Configuration whose options are visible to the expression
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Render a code string as it would be written at an address
    Render {
        code: String,

        /// Address the code is written to
        #[arg(long, default_value = "0x401000", value_parser = parse_hex_address)]
        at: u32,

        /// Configuration whose options and code caves are visible to the code
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Apply a configuration to a simulated process and report the result
    Apply {
        config: PathBuf,

        /// Register a handler for every breakpoint that only logs its hits
        #[arg(long)]
        stub_handlers: bool,

        /// What to do about missing breakpoint handlers
        #[arg(long, default_value = "warn")]
        policy: SymbolPolicy,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Dump memory of the simulated process, optionally after applying a configuration
    Hexdump {
        #[arg(value_parser = parse_hex_address)]
        address: u32,

        #[arg(short = 'n', long, default_value = "64")]
        size: usize,

        /// Show ASCII column
        #[arg(long)]
        ascii: bool,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the distance between two addresses, and the rel32 for a jump between them
    Offset { from: String, to: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "hackpoint=debug"
    } else {
        "hackpoint=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_target(false)
        .init();

    match cli.command {
        Command::Eval {
            expression,
            regs,
            config,
            target,
        } => commands::eval::run(&expression, &regs, config.as_deref(), &target),
        Command::Render {
            code,
            at,
            config,
            target,
        } => commands::render::run(&code, at, config.as_deref(), &target),
        Command::Apply {
            config,
            stub_handlers,
            policy,
            json,
            target,
        } => commands::apply::run(&config, stub_handlers, policy, json, &target),
        Command::Hexdump {
            address,
            size,
            ascii,
            config,
            target,
        } => commands::hexdump::run(address, size, ascii, config.as_deref(), &target),
        Command::Offset { from, to } => commands::offset::run(&from, &to),
    }
}
