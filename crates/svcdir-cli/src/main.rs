use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use svcdir_core::{CandidateRecord, Location, Service};
use svcdir_normalize::{parse_hours, read_raw_records, NormalizerConfig};
use svcdir_recon::{
    AutoSkipDisambiguator, Disambiguator, NoteResolution, ReconcilerConfig, ReconciliationDriver,
};
use svcdir_storage::{GeolocationResolver, GoogleGeocoder, HttpDirectoryApi, MatchMemory};

#[derive(Debug, Parser)]
#[command(name = "svcdir")]
#[command(about = "Service-directory ingest and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a JSON rows export against the directory.
    Run {
        /// Path to the exported rows file.
        #[arg(long)]
        input: PathBuf,
        /// Answer every disambiguation prompt with "none"/"keep existing".
        #[arg(long)]
        auto: bool,
    },
    /// Parse one free-text hours string and print the result.
    CheckHours { hours: String },
}

#[derive(Debug, Clone)]
struct Config {
    directory_api_url: String,
    directory_api_token: Option<String>,
    google_api_key: String,
    data_dir: PathBuf,
    match_radius: f64,
    min_hours_fresher: i64,
    max_days_since_update: i64,
    http_timeout_secs: u64,
    state: String,
    country: String,
    default_city: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            directory_api_url: std::env::var("SVCDIR_API_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            directory_api_token: std::env::var("SVCDIR_API_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            google_api_key: std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            data_dir: std::env::var("SVCDIR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            match_radius: std::env::var("SVCDIR_MATCH_RADIUS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30.0),
            min_hours_fresher: std::env::var("MIN_HOURS_FRESHER_OVERRIDE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_days_since_update: std::env::var("MAX_DAYS_SINCE_LAST_UPDATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            http_timeout_secs: std::env::var("SVCDIR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            state: std::env::var("SVCDIR_STATE").unwrap_or_else(|_| "NY".to_string()),
            country: std::env::var("SVCDIR_COUNTRY").unwrap_or_else(|_| "US".to_string()),
            default_city: std::env::var("SVCDIR_DEFAULT_CITY")
                .unwrap_or_else(|_| "New York".to_string()),
        }
    }
}

fn prompt_choice(header: &str, options: &[String], none_label: &str) -> Result<Option<usize>> {
    println!("{header}");
    for (index, option) in options.iter().enumerate() {
        println!("  [{}] {option}", index + 1);
    }
    println!("  [0] {none_label}");
    loop {
        print!("> ");
        io::stdout().flush().context("flushing prompt")?;
        let mut line = String::new();
        io::stdin().read_line(&mut line).context("reading answer")?;
        match line.trim().parse::<usize>() {
            Ok(0) => return Ok(None),
            Ok(n) if n <= options.len() => return Ok(Some(n - 1)),
            _ => println!("enter a number between 0 and {}", options.len()),
        }
    }
}

fn describe_location(location: &Location) -> String {
    let street = location
        .address
        .as_ref()
        .and_then(|address| address.street.clone())
        .unwrap_or_else(|| "unknown address".to_string());
    match &location.name {
        Some(name) => format!("{} - {} @ {}", location.organization.name, name, street),
        None => format!("{} @ {}", location.organization.name, street),
    }
}

/// Interactive stdin tie-break channel.
struct PromptDisambiguator;

#[async_trait]
impl Disambiguator for PromptDisambiguator {
    async fn choose_location(
        &self,
        candidate: &CandidateRecord,
        options: &[Location],
    ) -> Result<Option<usize>> {
        let labels: Vec<String> = options.iter().map(describe_location).collect();
        prompt_choice(
            &format!(
                "Are any of these nearby locations the same as {}?",
                candidate.organization_name
            ),
            &labels,
            "None of these",
        )
    }

    async fn choose_service(
        &self,
        candidate: &CandidateRecord,
        options: &[Service],
    ) -> Result<Option<usize>> {
        let labels: Vec<String> = options.iter().map(|service| service.name.clone()).collect();
        prompt_choice(
            &format!(
                "Are any of these {} services in {} the same as {}?",
                candidate.taxonomy_label, candidate.organization_name, candidate.service_name
            ),
            &labels,
            "None of these",
        )
    }

    async fn resolve_note_conflict(
        &self,
        entity_name: &str,
        existing: &str,
        incoming: &str,
    ) -> Result<NoteResolution> {
        let options = vec![
            format!("Keep existing: {existing:?}"),
            format!("Replace with new: {incoming:?}"),
            "Combine both".to_string(),
        ];
        let answer = prompt_choice(
            &format!("Conflicting notes for {entity_name}:"),
            &options,
            "Keep existing",
        )?;
        Ok(match answer {
            Some(1) => NoteResolution::ReplaceWithNew,
            Some(2) => NoteResolution::Concatenate,
            _ => NoteResolution::KeepExisting,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input, auto } => {
            let config = Config::from_env();
            let rows = read_raw_records(&input)?;
            let timeout = Duration::from_secs(config.http_timeout_secs);

            let api = HttpDirectoryApi::new(
                config.directory_api_url.as_str(),
                config.directory_api_token.clone(),
                timeout,
            )?;
            let geocoder = GoogleGeocoder::new(config.google_api_key.as_str(), timeout)?;
            let memory = MatchMemory::load(config.data_dir.join("matching_data.json")).await?;
            let geolocation =
                GeolocationResolver::load(&config.data_dir, Box::new(geocoder)).await?;
            let ui: Box<dyn Disambiguator> = if auto {
                Box::new(AutoSkipDisambiguator)
            } else {
                Box::new(PromptDisambiguator)
            };

            let recon_config = ReconcilerConfig {
                match_radius: config.match_radius,
                min_hours_fresher: config.min_hours_fresher,
                max_days_since_update: config.max_days_since_update,
                source_label: "spreadsheet-import".to_string(),
                normalizer: NormalizerConfig {
                    state: config.state,
                    country: config.country,
                    default_city: config.default_city,
                },
            };

            let mut driver =
                ReconciliationDriver::new(recon_config, Box::new(api), ui, memory, geolocation);
            let summary = driver.run(rows).await?;
            println!(
                "run complete: rows={} prefiltered={} created={} updated={} unchanged={} skipped={}",
                summary.input_rows,
                summary.prefiltered_out,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.skipped
            );
        }
        Commands::CheckHours { hours } => match parse_hours(&hours) {
            Ok(parsed) => {
                for entry in &parsed.entries {
                    println!(
                        "{}: {} - {}",
                        entry.weekday,
                        entry.opens_at.format("%H:%M"),
                        entry.closes_at.format("%H:%M")
                    );
                }
                for day in &parsed.conflicting_days {
                    println!("conflicting hours on {day}; dropped");
                }
                for segment in &parsed.skipped_segments {
                    println!("skipped segment {segment:?}");
                }
            }
            Err(err) => eprintln!("{err}"),
        },
    }

    Ok(())
}
