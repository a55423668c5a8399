use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::error;
use oracle_ls::cache::DocumentVersion;
use oracle_ls::config::{self, ConfigError, ResolvedConfig, Settings};
use oracle_ls::error::error_chain;
use oracle_ls::service::{AnalyzeParams, Facet, Service};
use url::Url;

/// Language-intelligence server backed by an external analysis oracle
#[derive(Parser)]
#[command(name = "oracle-ls")]
#[command(version)]
#[command(about = "Language-intelligence server backed by an external analysis oracle")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file layered over the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Oracle executable (overrides [oracle].command)
    #[arg(long, global = true)]
    oracle: Option<String>,

    /// Argument passed to the oracle; repeat for several
    #[arg(long = "oracle-arg", global = true, allow_hyphen_values = true)]
    oracle_args: Vec<String>,

    /// Edit debounce interval in milliseconds (50-2000)
    #[arg(long, global = true)]
    debounce_ms: Option<u64>,

    /// Log filter, e.g. `debug` or `oracle_ls::bridge=trace` (default: RUST_LOG or info)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve line-delimited JSON requests on stdin/stdout (default)
    Serve,
    /// Start the oracle, print its health snapshot as JSON and stop
    Health,
    /// Run one consolidated query on a file and print the response JSON
    Analyze {
        /// Source file to analyze
        file: PathBuf,

        /// Facets to compute (parse, introspect, diagnostics, tokenize)
        #[arg(long, value_delimiter = ',')]
        include: Vec<Facet>,
    },
}

fn init_logging(filter: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    // stdout carries the protocol.
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig, ConfigError> {
    let mut overrides = Settings::default();
    overrides.oracle.command = cli.oracle.clone();
    if !cli.oracle_args.is_empty() {
        overrides.oracle.args = Some(cli.oracle_args.clone());
    }
    overrides.scheduler.debounce_ms = cli.debounce_ms;

    let outcome = config::load_settings(cli.config.as_deref(), overrides)?;
    outcome.events.iter().for_each(|event| event.log());

    let (resolved, events) = ResolvedConfig::resolve(&outcome.settings)?;
    events.iter().for_each(|event| event.log());
    Ok(resolved)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", error_chain(&e));
            return ExitCode::FAILURE;
        }
    };
    let service = Service::new(config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(e) = service.start().await {
                error!("Failed to start oracle: {}", error_chain(&e));
                return ExitCode::FAILURE;
            }
            let code =
                match oracle_ls::server::serve(service, tokio::io::stdin(), tokio::io::stdout())
                    .await
                {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("Front end failed: {}", e);
                        1
                    }
                };
            // The stdin reader may still be parked in a blocking read after
            // a `shutdown` request; dropping the runtime would wait for it.
            std::process::exit(code);
        }
        Commands::Health => {
            let started = service.start().await;
            if let Err(e) = &started {
                error!("Failed to start oracle: {}", error_chain(e));
            }
            let printed = print_json(&service.health());
            service.shutdown().await;
            if started.is_ok() && printed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Analyze { file, include } => {
            let code = analyze_file(&service, &file, include).await;
            service.shutdown().await;
            code
        }
    }
}

async fn analyze_file(service: &Arc<Service>, file: &Path, include: Vec<Facet>) -> ExitCode {
    let text = match tokio::fs::read_to_string(file).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: failed to read {}: {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let uri = match std::fs::canonicalize(file)
        .ok()
        .and_then(|path| Url::from_file_path(path).ok())
    {
        Some(uri) => uri,
        None => {
            eprintln!("Error: cannot build a file URI for {}", file.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = service.start().await {
        eprintln!("Error: failed to start oracle: {}", error_chain(&e));
        return ExitCode::FAILURE;
    }

    let mut params = AnalyzeParams::new(uri, text);
    if !include.is_empty() {
        params = params.with_include(include);
    }
    let result = match DocumentVersion::fingerprint(file) {
        Ok(version) => service.analyze_versioned(params, version).await,
        Err(_) => service.analyze(params).await,
    };

    match result {
        Ok(response) if print_json(&response) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", error_chain(&e));
            ExitCode::FAILURE
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            true
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    }
}
