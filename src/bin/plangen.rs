//! plangen [--config FILE] [--fallbacks] [REQUEST.json]
//!
//! Runs one orchestration and prints the AssembledResult as JSON.
//! Exits 2 when some slots could not be filled.

use std::path::PathBuf;
use std::process::ExitCode;
use clap::Parser;
use log::{debug, error};
use plangen::{GenerationRequest, Orchestrator, PlanGenConfig};

/// Generate a structured plan from a partitioned LLM request
#[derive(Parser, Debug)]
#[command(name = "plangen")]
#[command(about = "Generate a structured plan from a partitioned LLM request", long_about = None)]
#[command(version)]
struct Cli
{   /// JSON config file; PLANGEN_* variables still override it
    #[arg(short, long)]
    config: Option<PathBuf>

  , /// Fill unfilled slots with placeholder options
    #[arg(long)]
    fallbacks: bool

  , /// Request JSON file; a three-meal demo request when omitted
    request: Option<PathBuf>
}

fn demo_request() -> GenerationRequest
{   GenerationRequest::meal_plan(&[
      ("breakfast", 450.0),
      ("lunch", 540.0),
      ("dinner", 510.0),
    ])
    .with_context("Patient: age 45, male, type 2 diabetes")
    .with_context("Diet: non-vegetarian")
}

async fn run(args: Cli) -> plangen::Result<bool>
{   let config = match &args.config
    {   Some(path) => {
          let mut config = PlanGenConfig::from_json_file(path)?;
          config.apply_env(|name| std::env::var(name).ok())?;
          config.validate()?;
          config
        }
      , None => PlanGenConfig::from_env()?
    };
    debug!("Config: {:?}", config);

    let request = match &args.request
    {   Some(path) => {
          let text = std::fs::read_to_string(path).map_err(|e| {
            plangen::Error::InvalidRequest(
              format!("{}: {}", path.display(), e)
            )
          })?;
          serde_json::from_str::<GenerationRequest>(&text).map_err(|e| {
            plangen::Error::InvalidRequest(
              format!("{}: {}", path.display(), e)
            )
          })?
        }
      , None => demo_request()
    };

    let orchestrator = Orchestrator::from_config(&config)?;
    let mut result = orchestrator.generate(&request, None).await?;
    let complete = result.is_complete();
    if args.fallbacks
    {   result = result.with_fallbacks(&request.slots);
    }

    let json = serde_json::to_string_pretty(&result)
      .map_err(|e| plangen::Error::Other(e.to_string()))?;
    println!("{}", json);
    Ok(complete)
}

#[tokio::main]
async fn main() -> ExitCode
{   env_logger::init();
    let cli = Cli::parse();
    debug!("Arguments: {:?}", cli);
    match run(cli).await
    {   Ok(true) => ExitCode::SUCCESS
      , Ok(false) => ExitCode::from(2)
      , Err(e) => {
          error!("plangen failed: {}", e);
          eprintln!("plangen: {}", e);
          ExitCode::FAILURE
        }
    }
}
