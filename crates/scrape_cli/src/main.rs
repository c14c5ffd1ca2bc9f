//! `scrape`: run one extraction request and print the result as JSON.
//!
//! Exit status is 0 when the run reached `done`, 2 when it was rejected.

mod config;
mod logging;

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use engine_logging::engine_info;
use scrape_core::ExtractionRequest;
use scrape_engine::Orchestrator;

use crate::logging::LogDestination;

#[derive(Parser)]
#[command(name = "scrape")]
#[command(about = "Extract structured records from web pages and APIs")]
struct Cli {
    /// Request file (JSON). `-` reads standard input.
    #[arg(short, long, default_value = "-")]
    request: PathBuf,

    /// RON settings file; `SCRAPE_*` environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogDestination::Terminal)]
    log: LogDestination,

    /// Pretty-print the result.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = config::load_settings(cli.config.as_deref()).context("loading settings")?;
    logging::initialize(cli.log, config::log_level(&settings)?);
    engine_info!("Exports go to {:?}", settings.exports_dir);

    let request = read_request(&cli.request)?;
    let orchestrator = Orchestrator::from_settings(&settings);
    let result = orchestrator.run(&request).await;

    let output = if cli.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    }
    .context("serializing result")?;
    println!("{output}");

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn read_request(path: &Path) -> Result<ExtractionRequest> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading request from stdin")?;
        buf
    } else {
        fs::read_to_string(path).with_context(|| format!("reading request file {path:?}"))?
    };
    parse_request(&text)
}

fn parse_request(text: &str) -> Result<ExtractionRequest> {
    serde_json::from_str(text).context("request is not a valid extraction request")
}
