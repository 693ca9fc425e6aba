//! Glimpse Runner CLI
//!
//! Entry point for the `glimpse-runner` command-line tool.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use glimpse_runner::runner::{RunOutcome, Runner, RunnerError, RunnerOptions};
use glimpse_runner::{ApiAuth, ApiClient, RunConfig};

#[derive(Parser)]
#[command(name = "glimpse-runner")]
#[command(about = "Run visual regression tests against the Glimpse service", version)]
struct Cli {
    /// Path to configuration file (JSON or TOML)
    #[arg(long, short = 'c')]
    conf: PathBuf,

    /// Print the outbound build payload before submitting
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    if !cli.conf.exists() {
        eprintln!(
            "Config file path \"{}\" cannot be found.",
            cli.conf.display()
        );
        return 1;
    }
    let config = match RunConfig::from_file(&cli.conf) {
        Ok(config) => config,
        Err(err) => {
            fail(&err.to_string());
            return 1;
        }
    };

    let api = match ApiClient::new(ApiAuth::ApiKey(config.api_key.clone())) {
        Ok(api) => api,
        Err(err) => {
            fail(&err.to_string());
            return 1;
        }
    };
    let runner = Runner::new(api).with_options(RunnerOptions {
        verbose: cli.verbose,
        ..RunnerOptions::default()
    });

    match runner.run(&config).await {
        Ok(RunOutcome::NoStates) => 0,
        Ok(RunOutcome::Completed { status }) => {
            println!("{}", status);
            0
        }
        Err(err) => {
            let message = err.to_string();
            fail(&message);
            match err {
                RunnerError::BuildFailed(_) => config.failure_exit_code as i32,
                _ => 1,
            }
        }
    }
}

fn fail(message: &str) {
    eprintln!("{}", message);
    eprintln!("---");
    eprintln!("Exiting Glimpse Runner");
    eprintln!("Need help? Contact: support@glimpse.dev");
}
