use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, error::ErrorKind};
use indexmap::IndexMap;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{RouterConfig, SourceDescriptor, resolve_steps, source_use_counts};
use crate::diff;
use crate::errors::ConfigError;
use crate::fetch::Fetcher;
use crate::lock::ProcessLock;
use crate::pipeline::{PipelineOptions, PipelineState, WAREHOUSE_API_DEV};
use crate::schedule::{RunEnd, ShutdownFlag, run_loop, signal_name};
use crate::transfer::GlobusTransferClient;

/// Program name the router embeds in activity identifiers and lock paths.
pub const ROUTER_APP: &str = "route_collections";
/// Program name of the diff tool.
pub const DIFF_APP: &str = "endpoint_diff";

#[derive(Debug, Parser)]
#[command(
    name = "route-collections",
    disable_help_subcommand = true,
    about = "Route collection metadata from configured sources into the warehouse",
    long_about = "Execute the configured fetch/transform/persist steps, once or on a \
                  peak-aware schedule, reconciling collection metadata into the warehouse store."
)]
struct RouterCli {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        help = "JSON run configuration file"
    )]
    config: PathBuf,
    #[arg(long, help = "Run one iteration and exit")]
    once: bool,
    #[arg(
        long,
        help = "Write logs to the configured LOG_FILE instead of stderr"
    )]
    daemon: bool,
    #[arg(
        short = 'l',
        long = "log",
        value_name = "LEVEL",
        help = "Log level override (error, warn, info, debug, trace)"
    )]
    log: Option<String>,
    #[arg(long, help = "Target the development warehouse API")]
    dev: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "endpoint-diff",
    disable_help_subcommand = true,
    about = "Diff published endpoint registrations against the transfer service",
    long_about = "Fetch the published endpoint registry and the account's registered \
                  endpoints, compare field by field, and persist a timestamped report."
)]
struct DiffCli {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        help = "JSON run configuration file"
    )]
    config: PathBuf,
    #[arg(
        long = "registry-url",
        value_name = "URL",
        help = "Published registry override"
    )]
    registry_url: Option<String>,
    #[arg(
        long = "report-dir",
        value_name = "DIR",
        default_value = "var",
        help = "Directory receiving diff reports"
    )]
    report_dir: PathBuf,
    #[arg(
        short = 'l',
        long = "log",
        value_name = "LEVEL",
        help = "Log level override (error, warn, info, debug, trace)"
    )]
    log: Option<String>,
}

/// Router entry point. Returns the process exit code: 0 on a clean stop, the
/// signal number on a signal-driven stop, 1 on any fatal failure.
pub fn run_router<I>(args_iter: I) -> Result<u8, Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) = parse_cli::<RouterCli, _>(
        std::iter::once("route-collections".to_string()).chain(args_iter),
    )?
    else {
        return Ok(0);
    };

    let config = RouterConfig::load(&cli.config)?;
    init_logging(cli.log.as_deref(), &config, cli.daemon)?;
    info!(
        "[app] starting program={ROUTER_APP} pid={} config={}",
        std::process::id(),
        cli.config.display()
    );

    let lock_path = config.pid_file_path(ROUTER_APP);
    let _lock = ProcessLock::acquire(&lock_path)?;

    let catalogs = config.catalog_table()?;
    let steps = resolve_steps(&config.steps, &catalogs)?;
    let fetcher = Fetcher::new(
        config.http_timeout(),
        config.tls_verify(),
        source_use_counts(&steps),
    );

    let mut options = PipelineOptions::default();
    if cli.dev {
        options.warehouse_api_prefix = WAREHOUSE_API_DEV.to_string();
    }
    options.extra_endpoints_file = config.extra_endpoints_file.clone();

    let wants_listing = steps
        .iter()
        .any(|step| matches!(step.source, SourceDescriptor::Listing { .. }));
    let mut state = PipelineState::new(steps, fetcher, options);
    if wants_listing {
        state.transfer = Some(Box::new(connect_transfer(&config)?));
    }
    if !config.elastic_hosts.is_empty() {
        warn!(
            "[app] ELASTIC_HOSTS is set but no search-index backend is wired in; continuing without indexing"
        );
    }

    let shutdown = ShutdownFlag::install()?;
    match run_loop(&mut state, cli.once, &shutdown) {
        Ok(RunEnd::Completed) => {
            info!("[app] finished");
            Ok(0)
        }
        Ok(RunEnd::Signaled(signal)) => {
            info!(
                "Caught signal={signal}({}), exiting with rc={signal}",
                signal_name(signal)
            );
            Ok(signal as u8)
        }
        Err(err) => {
            error!("[app] fatal: {err}");
            Ok(1)
        }
    }
}

/// Diff-tool entry point. Returns the process exit code.
pub fn run_endpoint_diff_tool<I>(args_iter: I) -> Result<u8, Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) =
        parse_cli::<DiffCli, _>(std::iter::once("endpoint-diff".to_string()).chain(args_iter))?
    else {
        return Ok(0);
    };

    let config = RouterConfig::load_lenient(&cli.config)?;
    init_logging(cli.log.as_deref(), &config, false)?;
    info!(
        "[app] starting program={DIFF_APP} pid={} config={}",
        std::process::id(),
        cli.config.display()
    );

    let subscription_id = config
        .subscription_id
        .clone()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ConfigError::Invalid("missing config XSEDE_SUBSCRIPTION_ID".to_string())
        })?;
    let registry_url = cli
        .registry_url
        .unwrap_or_else(|| diff::REGISTRY_URL.to_string());

    let mut fetcher = Fetcher::new(config.http_timeout(), config.tls_verify(), IndexMap::new());
    let registry = diff::fetch_registry(&mut fetcher, &registry_url)?;
    let client = connect_transfer(&config)?;
    let report_path =
        diff::run_endpoint_diff(&registry, &client, &subscription_id, &cli.report_dir)?;
    info!("[app] diff report at {}", report_path.display());
    Ok(0)
}

fn connect_transfer(config: &RouterConfig) -> Result<GlobusTransferClient, Box<dyn Error>> {
    let client_id = config
        .globus_client_id
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::Invalid("missing config GLOBUS_CLIENT_ID".to_string()))?;
    let refresh_token = config
        .globus_refresh_token
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::Invalid("missing config GLOBUS_REFRESH_TOKEN".to_string()))?;
    Ok(GlobusTransferClient::connect(
        config.http_timeout(),
        config.tls_verify(),
        client_id,
        refresh_token,
    )?)
}

/// Level precedence: CLI `--log`, then config `LOG_LEVEL`, then `RUST_LOG`,
/// then `info`.
fn init_logging(
    cli_level: Option<&str>,
    config: &RouterConfig,
    daemon: bool,
) -> Result<(), Box<dyn Error>> {
    let filter = match cli_level.or(config.log_level.as_deref()) {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|err| format!("invalid log level '{level}': {err}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if daemon {
        let path = config.log_file.as_ref().ok_or_else(|| {
            ConfigError::Invalid("missing config LOG_FILE for --daemon".to_string())
        })?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let _ = builder
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init();
    } else {
        let _ = builder.try_init();
    }
    Ok(())
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}
