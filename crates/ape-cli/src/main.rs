//! Ape command-line runner
//!
//! Evaluates a script file or a `-e` expression through the embedding
//! façade and prints errors in their serialized form.

use ape_runtime::Ape;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ape", version, about = "Run Ape scripts")]
struct Cli {
    /// Script file to run
    file: Option<PathBuf>,

    /// Evaluate an expression and print its value
    #[arg(short = 'e', long = "eval", conflicts_with = "file")]
    eval: Option<String>,

    /// Wall-clock execution limit in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Print the disassembled bytecode instead of executing
    #[arg(long)]
    disassemble: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut ape = Ape::new();

    if let Some(timeout) = cli.timeout {
        ape.set_timeout(timeout);
    }

    let result = match (&cli.file, &cli.eval) {
        (Some(path), _) => {
            if cli.disassemble {
                return disassemble_file(&mut ape, path);
            }
            ape.execute_file(path)
        }
        (None, Some(source)) => {
            ape.set_repl_mode(true);
            if cli.disassemble {
                return disassemble_source(&mut ape, source);
            }
            ape.execute(source)
        }
        (None, None) => {
            eprintln!("usage: ape <file> | ape -e <expression>");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(value) => {
            if cli.eval.is_some() && !value.is_null() {
                println!("{}", ape.to_display_string(value));
            }
            ExitCode::SUCCESS
        }
        Err(_) => {
            for err in ape.errors() {
                eprint!("{}", err.serialize());
            }
            ExitCode::FAILURE
        }
    }
}

fn disassemble_file(ape: &mut Ape, path: &PathBuf) -> ExitCode {
    match std::fs::read_to_string(path) {
        Ok(source) => disassemble_source(ape, &source),
        Err(err) => {
            eprintln!("failed to read '{}': {}", path.display(), err);
            ExitCode::FAILURE
        }
    }
}

fn disassemble_source(ape: &mut Ape, source: &str) -> ExitCode {
    match ape.compile(source) {
        Ok(program) => {
            print!("{}", ape_runtime::disassemble(&program.code().bytecode));
            ExitCode::SUCCESS
        }
        Err(_) => {
            for err in ape.errors() {
                eprint!("{}", err.serialize());
            }
            ExitCode::FAILURE
        }
    }
}
