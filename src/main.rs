//! Command-line front end
//!
//! A development surface over the library: compile a method in its textual
//! form and run it, dump its bytecode, or print every intermediate stage.
//! Hosts embed the library directly; this binary exists for poking at the
//! compiler.

use clap::{Parser, Subcommand};
use cinnabar::dom::DomTree;
use cinnabar::il;
use cinnabar::lift::lift;
use cinnabar::opt::{Optimizer, TmpAlloc};
use cinnabar::regalloc::allocate;
use cinnabar::ssa::construct_ssa;
use cinnabar::vm::bridge::{ClosedBridge, SymbolTables};
use cinnabar::{PatchConfig, PatchSession, Result, Value, Vm};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cinnabar", version, about = "Bytecode compiler and register VM")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a method and run it
    Run {
        /// Method source in textual form
        file: PathBuf,
        /// Integer arguments, one per method argument
        args: Vec<i32>,
    },
    /// Compile a method and print its bytecode
    Bytecode { file: PathBuf },
    /// Print every intermediate stage of the pipeline
    Stages { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "cinnabar=info",
        1 => "cinnabar=debug",
        _ => "cinnabar=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(false)
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Run { file, args } => {
            let source = fs::read_to_string(file)?;
            let tables = SymbolTables::new();
            let body = il::parse_method(&source, &tables)?;
            let session = PatchSession::new(PatchConfig::all(), tables);
            let patch = session.compile(&body)?;

            let values: Vec<Value> = args.iter().map(|&a| Value::from_i32(a)).collect();
            let mut vm = Vm::new();
            let out = vm.call(&patch.program, &values, &mut ClosedBridge)?;
            if patch.program.void {
                println!("ok (void)");
            } else {
                println!("{} (i64: {})", out.as_i32(), out.as_i64());
            }
        }
        Command::Bytecode { file } => {
            let source = fs::read_to_string(file)?;
            let tables = SymbolTables::new();
            let body = il::parse_method(&source, &tables)?;
            let session = PatchSession::new(PatchConfig::all(), tables);
            let patch = session.compile(&body)?;
            print!("{}", patch.program.disassemble());
        }
        Command::Stages { file } => {
            let source = fs::read_to_string(file)?;
            let tables = SymbolTables::new();
            let body = il::parse_method(&source, &tables)?;

            let mut cfg = lift(&body, &tables)?;
            println!("== lifted ==\n{}", cfg.dump());

            let dom = DomTree::build(&cfg);
            construct_ssa(&mut cfg, &dom)?;
            println!("== ssa ==\n{}", cfg.dump());

            let mut tmps = TmpAlloc::new();
            Optimizer::new(Default::default()).run(&mut cfg, &tables, &mut tmps)?;
            println!("== optimized ==\n{}", cfg.dump());

            let alloc = allocate(&mut cfg)?;
            println!("== allocated ({} registers) ==\n{}", alloc.register_count, cfg.dump());

            let program = cinnabar::emit::emit(&cfg, &alloc, &tables, &body)?;
            println!("== bytecode ==\n{}", program.disassemble());
        }
    }
    Ok(())
}
