use std::{error::Error, path::Path};

use clap::Parser;
use credit_ledger::{
    db::prod_db::{LendingConfig, ProdDb},
    utils::cancel::CancelToken,
};
use jiff::{SignedDuration, Timestamp, Zoned};
use log::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// Schema to use: credit, mortgages or a path to a JSON5 file.
    /// Overrides LEDGER_SCHEMA.
    #[arg(short, long)]
    schema: Option<String>,
}

/// Run this job daily.  New releases show up a few days into the month.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let env_file = format!(".env/{}.env", args.env);
    if dotenvy::from_path(Path::new(&env_file)).is_err() {
        info!("no {} file, using the environment as is", env_file);
    }

    let mut config = LendingConfig::from_env()?;
    if let Some(schema) = args.schema {
        config.schema = schema;
    }
    let archive = ProdDb::sedlabanki_lending(&config)?;
    let client = ProdDb::http_client(&config)?;
    let cancel = match config.run_deadline {
        Some(d) => CancelToken::with_deadline(Timestamp::now() + SignedDuration::try_from(d)?),
        None => CancelToken::new(),
    };

    let report = archive.update_duckdb(&client, Zoned::now().date(), &cancel)?;
    for r in &report.loaded {
        println!("{} - {} ({} rows)", r.source_name, r.month, r.rows);
    }
    if !report.skipped.is_empty() {
        eprintln!("Cancelled before: {}", report.skipped.join(", "));
    }
    for e in &report.failed {
        eprintln!("{}", e);
    }
    if !report.is_success() {
        return Err(Box::from(format!(
            "{} of {} sources failed",
            report.failed.len() + report.skipped.len(),
            archive.schema.sources.len()
        )));
    }

    Ok(())
}
