//! Command-line front end: `gla serve`, `gla analyze`, `gla status` and
//! `gla cancel`.

pub mod client;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gla_config::Config;
use gla_core::protocol::{AnalyzeRequest, StatusResponse, StreamEvent};
use gla_core::{AnalysisMethod, AnalysisResult};
use gla_server::GlaServer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub use client::{AnalysisClient, ClientError, SseFrame, SseParser};

/// Job analyzed when none is given.
const DEFAULT_JOB_ID: &str = "6610588906";

#[derive(Parser, Debug)]
#[command(name = "gla")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Explain grid job failures from their logs with language models", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ~/.config/gla/config.toml)
    #[arg(global = true, long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(global = true, long = "log-level", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the analysis server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Analyze a job's log through a running server
    Analyze {
        #[arg(long = "job-id", default_value = DEFAULT_JOB_ID)]
        job_id: String,

        /// Log file within the job (server default: pilotlog.txt)
        #[arg(long)]
        filename: Option<String>,

        /// Backend name, as listed by `gla status`
        #[arg(long)]
        backend: Option<String>,

        /// Server URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,

        /// Stream state transitions while the analysis runs
        #[arg(long)]
        stream: bool,

        /// Cap on the context budget in tokens
        #[arg(long = "max-tokens")]
        max_tokens: Option<usize>,

        /// Extra retrieval hint; may be repeated
        #[arg(long = "query")]
        query: Vec<String>,

        /// Print the raw JSON result
        #[arg(long)]
        json: bool,

        /// Reconnect attempts for a dropped stream
        #[arg(long = "max-reconnects", default_value_t = 3)]
        max_reconnects: usize,
    },

    /// Show server status and available backends
    Status {
        #[arg(long)]
        server: Option<String>,
    },

    /// Cancel a running analysis by its request token
    Cancel {
        token: String,

        #[arg(long)]
        server: Option<String>,
    },
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    execute(cli).await
}

pub async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let server = GlaServer::new(config)?;
            server.run().await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Analyze {
            job_id,
            filename,
            backend,
            server,
            stream,
            max_tokens,
            query,
            json,
            max_reconnects,
        } => {
            let client = AnalysisClient::new(server.unwrap_or_else(|| config.server.url()))?
                .with_max_reconnects(max_reconnects);
            let request = AnalyzeRequest {
                job_id,
                filename,
                backend,
                max_tokens,
                stream,
                query,
            };
            info!("Requesting analysis of job {} from {}", request.job_id, client.base_url());

            let outcome = if stream {
                client.analyze_streaming(&request, print_progress).await
            } else {
                client.analyze(&request).await
            };
            Ok(report(outcome, json))
        }

        Commands::Status { server } => {
            let client = AnalysisClient::new(server.unwrap_or_else(|| config.server.url()))?;
            match client.status().await {
                Ok(status) => {
                    print_status(&status);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(fail(&e)),
            }
        }

        Commands::Cancel { token, server } => {
            let client = AnalysisClient::new(server.unwrap_or_else(|| config.server.url()))?;
            match client.cancel(&token).await {
                Ok(()) => {
                    println!("Cancelled {}", token);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(fail(&e)),
            }
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report(outcome: Result<AnalysisResult, ClientError>, json: bool) -> ExitCode {
    match outcome {
        Ok(result) if json => match serde_json::to_string_pretty(&result) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&ClientError::Protocol(e.to_string())),
        },
        Ok(result) => {
            print!("{}", format_result(&result));
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn fail(error: &ClientError) -> ExitCode {
    eprintln!("Error: {}", error);
    if let ClientError::Analysis(analysis) = error {
        if analysis.retryable {
            eprintln!("This failure may be temporary; retrying later can help.");
        }
    }
    ExitCode::from(error.exit_code())
}

fn print_progress(event: &StreamEvent) {
    match event {
        StreamEvent::Session(info) if info.joined => eprintln!("Joined run {}", info.token),
        StreamEvent::Session(info) => eprintln!("Started run {}", info.token),
        StreamEvent::State(state) => match (&state.backend, &state.detail) {
            (Some(backend), Some(detail)) => eprintln!("  {} [{}] {}", state.state, backend, detail),
            (None, Some(detail)) => eprintln!("  {} {}", state.state, detail),
            (Some(backend), None) => eprintln!("  {} [{}]", state.state, backend),
            (None, None) => eprintln!("  {}", state.state),
        },
        StreamEvent::Result(_) | StreamEvent::Error(_) => debug!("Stream finished"),
    }
}

fn print_status(status: &StatusResponse) {
    println!("{} {} is {}: {}", status.service, status.version, status.status, status.message);
    println!("Active runs: {}", status.active_runs);
    println!("Backends:");
    for backend in &status.available_backends {
        let marker = if backend.is_default { " (default)" } else { "" };
        println!(
            "  {}{}: {} ({} token window)",
            backend.name, marker, backend.model, backend.context_window
        );
    }
}

/// Human-readable rendering of a result.
pub fn format_result(result: &AnalysisResult) -> String {
    let rule = "=".repeat(70);
    let thin = "-".repeat(70);
    let method = match result.analysis_method {
        AnalysisMethod::Full => "full log",
        AnalysisMethod::Rag => "retrieved excerpts",
    };
    let cited: Vec<String> = result
        .cited_chunks
        .iter()
        .map(|c| format!("#{} (lines {}-{})", c.id, c.lines.start, c.lines.end))
        .collect();

    let mut out = String::new();
    out.push_str(&format!("{}\nAnalysis of job {}\n{}\n", rule, result.job_id, rule));
    out.push_str(&format!("Log file:   {} ({} bytes)\n", result.filename, result.file_size));
    out.push_str(&format!("Backend:    {} ({})\n", result.backend, result.model));
    out.push_str(&format!(
        "Method:     {}, {} context tokens{}\n",
        method,
        result.context_tokens,
        if result.truncated { ", truncated" } else { "" }
    ));
    out.push_str(&format!(
        "Usage:      {} tokens in {:.1}s\n",
        result.tokens_used,
        Duration::from_millis(result.latency_ms).as_secs_f64()
    ));
    out.push_str(&format!("Cited:      {}\n", cited.join(", ")));
    out.push_str(&format!("{}\n{}\n{}\n", thin, result.explanation.trim_end(), rule));
    out
}
