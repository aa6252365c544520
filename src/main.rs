use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reconverge_core::config::ConvergenceConfig;
use reconverge_loop::{run_convergence, ConvergenceReport, ConvergenceRunner, RunOptions};

#[derive(Parser)]
#[command(
    name = "reconverge",
    version,
    about = "Retry a task until it converges: run, check, fix, repeat"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "reconverge.toml", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the convergence loop described by the config
    Run {
        /// Variable for ${VAR} substitution (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Override the configured working directory
        #[arg(long)]
        working_dir: Option<PathBuf>,
        /// Override the step ceiling
        #[arg(long)]
        step_limit: Option<usize>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the workflow and print the compiled graph
    Graph,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "reconverge=debug,warn"
    } else {
        "reconverge=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "reconverge", &mut std::io::stdout());
            Ok(())
        }
        Commands::Graph => {
            let config = ConvergenceConfig::load(&cli.config)?;
            let graph = ConvergenceRunner::new().compile(config.workflow.as_ref())?;
            println!("{}", config.name);
            print!("{graph}");
            Ok(())
        }
        Commands::Run {
            vars,
            working_dir,
            step_limit,
            json,
        } => {
            let config = ConvergenceConfig::load(&cli.config)?;
            info!(config = %cli.config.display(), name = %config.name, "Loaded config");

            let options = RunOptions {
                env_vars: vars.into_iter().collect::<BTreeMap<_, _>>(),
                working_directory: working_dir,
                step_limit,
                ..Default::default()
            };
            let report = run_convergence(&config, options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if !report.success {
                error!(attempts = report.attempts, "Did not converge");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn print_report(report: &ConvergenceReport) {
    let status = if report.success { "converged" } else { "did not converge" };
    println!("{}: {}", report.config_name, status);
    println!(
        "  attempts: {}/{}  steps: {}  elapsed: {}ms",
        report.attempts + 1,
        report.max_attempts,
        report.visited.len(),
        report.elapsed_ms
    );

    for result in &report.pre_action_results {
        let mark = if result.success { "ok" } else { "FAILED" };
        println!("  pre-action [{mark}] {}", result.action);
    }
    if let Some(main) = &report.main_script_result {
        let mark = if main.success { "ok" } else { "FAILED" };
        println!("  main script [{mark}] {}", main.action);
    }
    for (i, cycle) in report.failure_history.iter().enumerate() {
        let failed: Vec<&str> = cycle
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.validator_name.as_str())
            .collect();
        println!("  check round {}: failed {}", i + 1, failed.join(", "));
    }
}
