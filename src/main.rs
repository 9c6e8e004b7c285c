//! parrot-core CLI
//!
//! Usage:
//!   parrot-core run --config engines.yaml --program program.yaml
//!
//! Runs a declarative program against a simulated engine fleet, exercising
//! the Executor/Dispatcher/Session pipeline end-to-end. Exit codes: 0 on
//! success, non-zero on any fatal error (spec.md §6).

use clap::{Parser, Subcommand};
use parrot_core::cli::{build_controller, run_program, Program};
use parrot_core::config::Config;

#[derive(Parser)]
#[command(name = "parrot-core")]
#[command(author, version, about = "Semantic-function session executor and dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a declarative program against a configured engine fleet.
    Run {
        /// Engine fleet / dispatcher policy configuration (YAML).
        #[arg(short, long)]
        config: String,

        /// Program to execute (YAML): function declarations plus a call
        /// sequence.
        #[arg(short, long)]
        program: String,

        /// Print a per-call timing report on clean exit.
        #[arg(long, default_value_t = false)]
        timeit: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parrot_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            program,
            timeit,
        } => {
            let config = Config::from_file(&config)?;
            let program = Program::from_file(&program)?;
            let mut controller = build_controller(&config);

            match run_program(&mut controller, &program).await {
                Ok(reports) => {
                    if timeit {
                        for report in &reports {
                            println!(
                                "session {} on engine {}: {:?}",
                                report.session_id, report.engine_id, report.elapsed
                            );
                        }
                    }
                    tracing::info!(calls = reports.len(), "program completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "fatal error, exiting fail-fast");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
