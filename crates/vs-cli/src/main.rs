//! # vs-cli — The "Bell Tower" of VESPER
//!
//! Entry points for the scanner:
//!
//! - `vesper scan` runs one time-budgeted pass over the indicator
//!   corpus.
//! - `vesper watch` rings every interval: one scan per tick until
//!   interrupted. Indicators stamped inside the window are filtered
//!   out by the eligibility query, so overlapping work is naturally
//!   deduplicated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vs_model::Interval;
use vs_scan::{run_scan, ScanParams};
use vs_search::http::HttpBackend;
use vs_search::SearchBackend;

#[derive(Parser)]
#[command(name = "vesper", version, about = "Threat-indicator correlation scanner")]
struct Cli {
    /// Path to config file
    #[arg(long, default_value = "vesper.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one time-budgeted scan.
    Scan {
        #[command(flatten)]
        opts: ScanOpts,
    },

    /// Run a scan every interval until interrupted.
    Watch {
        #[command(flatten)]
        opts: ScanOpts,
    },
}

#[derive(clap::Args, Clone)]
struct ScanOpts {
    /// Search backend base URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Indicator index (repeatable)
    #[arg(long = "threat-index")]
    threat_index: Vec<String>,

    /// Event index (repeatable)
    #[arg(long = "events-index")]
    events_index: Vec<String>,

    /// Max in-flight event-match operations per page
    #[arg(long)]
    concurrency: Option<usize>,

    /// Scheduling interval and wall-clock budget (e.g. 10s, 5m, 1h)
    #[arg(long)]
    interval: Option<Interval>,

    /// Basic-auth username
    #[arg(long)]
    username: Option<String>,

    /// Basic-auth password
    #[arg(long)]
    password: Option<String>,

    /// Per-indicator debug output
    #[arg(long)]
    verbose: bool,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    backend: BackendConfig,
    #[serde(default)]
    scan: ScanConfig,
}

#[derive(Deserialize, Clone)]
struct BackendConfig {
    #[serde(default = "default_backend_url")]
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            username: None,
            password: None,
        }
    }
}

#[derive(Deserialize, Clone)]
struct ScanConfig {
    #[serde(default = "default_threat_index")]
    threat_index: Vec<String>,
    #[serde(default = "default_events_index")]
    events_index: Vec<String>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_interval")]
    interval: Interval,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threat_index: default_threat_index(),
            events_index: default_events_index(),
            concurrency: default_concurrency(),
            interval: default_interval(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_threat_index() -> Vec<String> {
    vec!["threat-indicators".to_string()]
}
fn default_events_index() -> Vec<String> {
    vec!["events".to_string()]
}
fn default_concurrency() -> usize {
    10
}
fn default_interval() -> Interval {
    "1m".parse().expect("static interval literal")
}

/// Flags win over the config file; the config file wins over the
/// built-in defaults.
fn resolve(opts: &ScanOpts, config: &Config) -> (String, Option<(String, String)>, ScanParams) {
    let url = opts
        .backend_url
        .clone()
        .unwrap_or_else(|| config.backend.url.clone());

    let username = opts.username.clone().or_else(|| config.backend.username.clone());
    let password = opts.password.clone().or_else(|| config.backend.password.clone());
    let credentials = username.map(|u| (u, password.unwrap_or_default()));

    let params = ScanParams {
        threat_index: if opts.threat_index.is_empty() {
            config.scan.threat_index.clone()
        } else {
            opts.threat_index.clone()
        },
        events_index: if opts.events_index.is_empty() {
            config.scan.events_index.clone()
        } else {
            opts.events_index.clone()
        },
        concurrency: opts.concurrency.unwrap_or(config.scan.concurrency).max(1),
        verbose: opts.verbose,
        interval: opts
            .interval
            .clone()
            .unwrap_or_else(|| config.scan.interval.clone()),
    };

    (url, credentials, params)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vesper=info,vs_scan=info,vs_search=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        let content = std::fs::read_to_string(&cli.config).unwrap_or_default();
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!("Failed to parse {:?}: {}", cli.config, err);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Scan { opts } => {
            let (url, credentials, params) = resolve(&opts, &config);
            let backend = connect(&url, credentials);
            if let Err(err) = run_scan(backend, &params).await {
                tracing::error!("Scan failed: {}", err);
                std::process::exit(1);
            }
        }

        Commands::Watch { opts } => {
            let (url, credentials, params) = resolve(&opts, &config);
            let backend = connect(&url, credentials);
            watch(backend, params).await;
        }
    }
}

fn connect(url: &str, credentials: Option<(String, String)>) -> Arc<dyn SearchBackend> {
    match HttpBackend::new(url, credentials) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            tracing::error!("Failed to construct backend client: {}", err);
            std::process::exit(1);
        }
    }
}

/// Run a scan per interval tick until Ctrl-C. A paused run simply
/// resumes on the next tick; a fatal run is logged and retried.
async fn watch(backend: Arc<dyn SearchBackend>, params: ScanParams) {
    let period = Duration::from_millis(params.interval.as_millis());
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!("Watching every {} (Ctrl-C to stop)", params.interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_scan(backend.clone(), &params).await {
                    Ok(report) if report.paused => {
                        tracing::info!(run_id = %report.run_id, "run paused, next tick resumes");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!("Scan failed: {}", err);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping watch");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let config = Config::default();
        let opts = ScanOpts {
            backend_url: Some("http://search.internal:9200".into()),
            threat_index: vec!["ti-prod".into()],
            events_index: Vec::new(),
            concurrency: Some(32),
            interval: Some("5m".parse().unwrap()),
            username: None,
            password: None,
            verbose: false,
        };
        let (url, credentials, params) = resolve(&opts, &config);
        assert_eq!(url, "http://search.internal:9200");
        assert!(credentials.is_none());
        assert_eq!(params.threat_index, vec!["ti-prod".to_string()]);
        assert_eq!(params.events_index, vec!["events".to_string()]);
        assert_eq!(params.concurrency, 32);
        assert_eq!(params.interval.as_secs(), 300);
    }

    #[test]
    fn test_config_file_shape() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            url = "http://search.internal:9200"
            username = "scanner"
            password = "hunter2"

            [scan]
            threat_index = ["ti-a", "ti-b"]
            concurrency = 25
            interval = "10s"
            "#,
        )
        .unwrap();
        assert_eq!(config.scan.threat_index.len(), 2);
        assert_eq!(config.scan.interval.as_secs(), 10);
        assert_eq!(config.scan.events_index, vec!["events".to_string()]);

        let opts = ScanOpts {
            backend_url: None,
            threat_index: Vec::new(),
            events_index: Vec::new(),
            concurrency: None,
            interval: None,
            username: None,
            password: None,
            verbose: true,
        };
        let (url, credentials, params) = resolve(&opts, &config);
        assert_eq!(url, "http://search.internal:9200");
        assert_eq!(credentials, Some(("scanner".to_string(), "hunter2".to_string())));
        assert_eq!(params.concurrency, 25);
    }
}
