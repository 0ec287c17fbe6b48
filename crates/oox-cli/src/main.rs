//! Command-line interface for the OOX symbolic verifier.

use clap::{Parser, Subcommand};
use miette::{Diagnostic, NamedSource, SourceSpan};
use oox_engine::{Configuration, VerificationResult};
use oox_syntax::DeclarationMember;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI error with source context for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("failed to read file: {message}")]
    IoError { message: String },

    #[error("parse error: {message}")]
    #[diagnostic(code(oox::parse_error))]
    ParseError {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("control-flow graph error: {message}")]
    CfgError { message: String },

    #[error("verification error: {message}")]
    EngineError { message: String },
}

impl CliError {
    fn from_parse_error(e: oox_syntax::ParseError, source: Arc<String>, filename: &str) -> Self {
        let span = e.span();
        CliError::ParseError {
            message: e.to_string(),
            src: NamedSource::new(filename, source),
            span: (span.offset, span.length).into(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "oox", version)]
#[command(about = "Symbolic execution verifier for OOX programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an OOX file and show its declarations
    Parse {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Dump the full AST
        #[arg(short, long)]
        verbose: bool,
    },

    /// Verify an entry point of an OOX file
    Verify {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Entry point as Class.method
        #[arg(short, long, value_name = "CLASS.METHOD")]
        entry_point: String,

        /// Step budget per exploration branch
        #[arg(short = 'k', long, default_value = "40")]
        max_depth: u64,

        /// Skip ensures clauses
        #[arg(long, help_heading = "Contracts")]
        no_ensures: bool,

        /// Skip requires clauses
        #[arg(long, help_heading = "Contracts")]
        no_requires: bool,

        /// Skip exceptional clauses
        #[arg(long, help_heading = "Contracts")]
        no_exceptional: bool,

        /// Exclude null from symbolic reference alias sets
        #[arg(long, help_heading = "Symbolic")]
        no_symbolic_nulls: bool,

        /// Disable lazy alias expansion between symbolic references
        #[arg(long, help_heading = "Symbolic")]
        no_symbolic_aliases: bool,

        /// Upper bound on symbolic array lengths
        #[arg(long, default_value = "2", help_heading = "Symbolic")]
        symbolic_array_size: usize,

        /// Disable the solver formula cache
        #[arg(long, help_heading = "Solver")]
        no_cache: bool,

        /// Disable partial-order reduction
        #[arg(long, help_heading = "Scheduling")]
        no_por: bool,

        /// Disable local constant folding
        #[arg(long, help_heading = "Solver")]
        no_local_solver: bool,

        /// Shuffle thread selection order
        #[arg(long, help_heading = "Scheduling")]
        random_interleaving: bool,

        /// 0 = silent, 1 = info, 2 = debug, 3 = trace
        #[arg(long, default_value = "1")]
        log_level: u8,

        /// Emit exploration statistics
        #[arg(long)]
        benchmark: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            2
        }
    };
    std::process::exit(code);
}

fn init_tracing(log_level: u8) {
    let directive = match log_level {
        0 => "off",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn read_source(file: &PathBuf) -> CliResult<(Arc<String>, String)> {
    let source = fs::read_to_string(file).map_err(|e| CliError::IoError {
        message: format!("{}: {}", file.display(), e),
    })?;
    let filename = file.display().to_string();
    Ok((Arc::new(source), filename))
}

fn run(cli: Cli) -> CliResult<i32> {
    match cli.command {
        Commands::Parse { file, verbose } => {
            let (source, filename) = read_source(&file)?;
            let unit = oox_syntax::parse(&source)
                .map_err(|e| CliError::from_parse_error(e, source.clone(), &filename))?;
            if verbose {
                println!("{:#?}", unit);
            } else {
                for class in &unit.classes {
                    println!("class {}", class.name);
                    for member in &class.members {
                        match member {
                            DeclarationMember::Field { name, .. } => {
                                println!("  field {}", name);
                            }
                            DeclarationMember::Constructor { name, params, .. } => {
                                println!("  constructor {}/{}", name, params.len());
                            }
                            DeclarationMember::Method {
                                is_static,
                                name,
                                params,
                                ..
                            } => {
                                let kind = if *is_static { "static method" } else { "method" };
                                println!("  {} {}/{}", kind, name, params.len());
                            }
                        }
                    }
                }
            }
            Ok(0)
        }

        Commands::Verify {
            file,
            entry_point,
            max_depth,
            no_ensures,
            no_requires,
            no_exceptional,
            no_symbolic_nulls,
            no_symbolic_aliases,
            symbolic_array_size,
            no_cache,
            no_por,
            no_local_solver,
            random_interleaving,
            log_level,
            benchmark,
        } => {
            init_tracing(log_level);

            let (source, filename) = read_source(&file)?;
            let unit = oox_syntax::parse(&source)
                .map_err(|e| CliError::from_parse_error(e, source.clone(), &filename))?;
            let (cfg, symbols) = oox_cfg::build(&unit).map_err(|e| CliError::CfgError {
                message: e.to_string(),
            })?;

            let config = Configuration {
                file_name: file,
                entry_point,
                maximum_depth: max_depth,
                verify_ensures: !no_ensures,
                verify_requires: !no_requires,
                verify_exceptional: !no_exceptional,
                symbolic_nulls: !no_symbolic_nulls,
                symbolic_aliases: !no_symbolic_aliases,
                symbolic_array_size,
                cache_formulas: !no_cache,
                apply_por: !no_por,
                apply_local_solver: !no_local_solver,
                apply_random_interleaving: random_interleaving,
                log_level,
                run_benchmark: benchmark,
            };

            let outcome =
                oox_engine::verify(&cfg, &symbols, &config).map_err(|e| CliError::EngineError {
                    message: e.to_string(),
                })?;
            info!(verdict = %outcome.result, "verification finished");
            println!("{}", outcome.result);

            Ok(match outcome.result {
                VerificationResult::Valid => 0,
                VerificationResult::Invalid { .. } | VerificationResult::Deadlock => 1,
            })
        }
    }
}
