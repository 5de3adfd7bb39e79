//! CLI front end (§6): parses command-line flags, loads one batch's
//! configuration file, and drives its Loading Loop to completion.
//!
//! Grounded in the original engine's `main.c` flag set (`-c -e -f -h -l -m
//! -o -r -s -t -v -u`); the parser itself is new code built with `clap`'s
//! derive API rather than copied from any reference implementation, since
//! the CLI's internals are unspecified by the distilled spec.

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use smoothloader::client::ClientConfig;
use smoothloader::config::{self, ConfigError};
use smoothloader::engine::{LoadingLoop, StopFlag};
use smoothloader::errors::LoaderError;
use smoothloader::metrics;
use smoothloader::model::Batch;
use smoothloader::report::{write_ctx_dump, LogWriter, StatsFileWriter, DEFAULT_LOG_REWIND_BYTES};

/// Smooth-mode multi-protocol load generator.
#[derive(Parser, Debug)]
#[command(name = "smoothloader", version, about = "Smooth-mode multi-protocol load generator")]
struct Cli {
    /// Connect timeout in seconds, applied to every URL (must be > 0 when given).
    #[arg(short = 'c', long = "connect-timeout", value_name = "SECONDS")]
    connect_timeout_secs: Option<u64>,

    /// Disable per-client error recovery: a client that hits ERROR stays
    /// ERROR instead of advancing into its next cycle.
    #[arg(short = 'e', long = "no-error-recovery")]
    disable_error_recovery: bool,

    /// Batch configuration file (required).
    #[arg(short = 'f', long = "config", value_name = "PATH")]
    config_file: String,

    /// Logfile rewind cycles; must be >= 2 when given.
    #[arg(short = 'l', long = "log-rewind-cycles", value_name = "N")]
    log_rewind_cycles: Option<u32>,

    /// Loading mode: 0 = smooth (the only mode this core implements).
    /// Mode 1 (storm) is an explicit non-goal and is rejected.
    #[arg(short = 'm', long = "mode", default_value_t = 0)]
    mode: u8,

    /// Stream response bodies to stdout as they arrive.
    #[arg(short = 'o', long = "stdout-bodies")]
    stream_bodies_to_stdout: bool,

    /// Force fresh connections for every URL, overriding each URL's own setting.
    #[arg(short = 'r', long = "fresh-connect")]
    force_fresh_connect: bool,

    /// Divert structured log output to stderr instead of stdout.
    #[arg(short = 's', long = "stderr")]
    log_to_stderr: bool,

    /// Run this batch on its own OS thread (its own single-threaded Tokio
    /// runtime) instead of the process's shared runtime.
    #[arg(short = 't', long = "own-thread")]
    own_thread: bool,

    /// Verbose tracing: raises the default log level to `debug` unless
    /// `RUST_LOG` is already set.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Include real URLs (rather than a redacted placeholder) in `.log`
    /// trace lines.
    #[arg(short = 'u', long = "log-urls")]
    log_urls: bool,

    /// Port the Prometheus `/metrics` endpoint listens on.
    #[arg(long = "metrics-port", default_value_t = 9090)]
    metrics_port: u16,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if cli.log_to_stderr {
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

/// §6: non-zero exit on any validation failure.
fn validate_cli(cli: &Cli) -> Result<(), LoaderError> {
    if let Some(secs) = cli.connect_timeout_secs {
        if secs == 0 {
            return Err(LoaderError::Configuration("-c connect timeout must be > 0".into()));
        }
    }
    if let Some(cycles) = cli.log_rewind_cycles {
        if cycles < 2 {
            return Err(LoaderError::Configuration("-l logfile rewind cycles must be >= 2".into()));
        }
    }
    if cli.mode != 0 {
        return Err(LoaderError::Configuration(
            "mode 1 (storm) is not implemented by this core; only smooth mode (-m 0) is supported".into(),
        ));
    }
    if cli.stream_bodies_to_stdout {
        warn!(
            "-o (stream response bodies to stdout) has no effect: this transfer engine reads response \
             bodies as a single buffer and does not expose a streaming hook"
        );
    }
    Ok(())
}

/// Applies CLI overrides that take priority over the values the
/// configuration file set (§6: `-c`, `-r`).
fn apply_cli_overrides(batch: &mut Batch, cli: &Cli) {
    for url in &mut batch.urls {
        if let Some(secs) = cli.connect_timeout_secs {
            url.connect_timeout_ms = secs * 1000;
        }
        if cli.force_fresh_connect {
            url.fresh_connect = true;
        }
    }
    if cli.disable_error_recovery {
        batch.error_recovery_client = false;
    }
}

/// §6: "Requires an RLIMIT_NOFILE exceeding the client count; the loop
/// refuses to start otherwise" and "root privileges required for
/// per-client source address installation." Address installation itself
/// is an external collaborator, but both preconditions are still genuine
/// checks this core can perform before starting.
#[cfg(target_os = "linux")]
fn check_environment(client_num_max: usize) -> Result<(), LoaderError> {
    use procfs::process::{LimitValue, Process};

    let me = Process::myself()
        .map_err(|e| LoaderError::Environment(format!("failed to inspect own process via /proc: {e}")))?;

    let status = me
        .status()
        .map_err(|e| LoaderError::Environment(format!("failed to read /proc/self/status: {e}")))?;
    if status.euid != 0 {
        return Err(LoaderError::Environment(
            "root privileges are required (the engine installs per-client secondary source addresses \
             on a network interface)"
                .into(),
        ));
    }

    let limits = me
        .limits()
        .map_err(|e| LoaderError::Environment(format!("failed to read /proc/self/limits: {e}")))?;
    let nofile_ok = match limits.max_open_files.soft_limit {
        LimitValue::Unlimited => true,
        LimitValue::Value(v) => v > client_num_max as u64,
    };
    if !nofile_ok {
        return Err(LoaderError::Environment(format!(
            "RLIMIT_NOFILE must exceed the configured client count ({client_num_max}); raise it with `ulimit -n`"
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_environment(_client_num_max: usize) -> Result<(), LoaderError> {
    warn!("root-privilege and RLIMIT_NOFILE checks are only implemented on Linux; skipping on this platform");
    Ok(())
}

/// Periodic housekeeping: logs process RSS from `/proc/self/status`,
/// mirroring the sort of memory-pressure log line a long-running batch
/// process is expected to emit.
#[cfg(target_os = "linux")]
async fn memory_housekeeping_task() {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        interval.tick().await;
        match procfs::process::Process::myself().and_then(|p| p.status()) {
            Ok(status) => info!(rss_kb = status.vmrss.unwrap_or(0), "process memory housekeeping tick"),
            Err(e) => warn!(error = %e, "failed to read process memory status"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn memory_housekeeping_task() {
    std::future::pending::<()>().await;
}

fn config_error_to_loader_error(e: ConfigError) -> LoaderError {
    match e {
        ConfigError::Loader(inner) => inner,
        other => LoaderError::Configuration(other.to_string()),
    }
}

async fn run_batch(cli: Cli) -> Result<(), LoaderError> {
    let mut batch = config::load(&cli.config_file).map_err(config_error_to_loader_error)?;
    apply_cli_overrides(&mut batch, &cli);
    check_environment(batch.client_num_max)?;

    info!(
        batch = %batch.name,
        clients_max = batch.client_num_max,
        urls = batch.urls.len(),
        cycles = batch.cycles_num,
        interface = %batch.interface,
        "batch configuration loaded"
    );

    metrics::register_metrics().map_err(|e| LoaderError::Internal(format!("failed to register metrics: {e}")))?;
    let registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    tokio::spawn(metrics::start_metrics_server(cli.metrics_port, registry));
    tokio::spawn(memory_housekeeping_task());

    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, requesting a clean shutdown");
                stop.request_stop();
            }
        });
    }

    let log_path = format!("{}.log", batch.name);
    let stats_path = format!("{}.txt", batch.name);
    let ctx_path = format!("{}.ctx", batch.name);

    let log_writer = LogWriter::create(&log_path)
        .map(|w| {
            if let Some(cycles) = cli.log_rewind_cycles {
                w.with_rewind_bytes(DEFAULT_LOG_REWIND_BYTES * cycles as u64)
            } else {
                w
            }
        })
        .map_err(|e| {
            warn!(path = %log_path, error = %e, "failed to open .log file; trace lines will not be written");
            e
        })
        .ok();
    let stats_writer = StatsFileWriter::create(&stats_path)
        .map_err(|e| {
            warn!(path = %stats_path, error = %e, "failed to open .txt file; statistics snapshots will not be written");
            e
        })
        .ok();

    let client_config = ClientConfig {
        skip_tls_verify: true,
        resolve_target_addr: None,
        client_cert_path: None,
        client_key_path: None,
        custom_headers: None,
        pool_config: None,
    };

    let batch_name = batch.name.clone();
    let mut looper = LoadingLoop::new(batch, client_config, stop)?.with_log_urls(cli.log_urls);
    if let Some(w) = log_writer {
        looper = looper.with_log_writer(w);
    }
    if let Some(w) = stats_writer {
        looper = looper.with_stats_writer(w);
    }

    looper.run().await?;

    if let Err(e) = write_ctx_dump(&ctx_path, looper.clients()) {
        warn!(path = %ctx_path, error = %e, "failed to write .ctx end-of-run dump");
    }

    info!(batch = %batch_name, "batch run complete");
    Ok(())
}

/// `-t`: run this batch on its own OS thread, each with its own
/// single-threaded Tokio runtime, rather than the process's shared
/// multi-threaded runtime.
fn run_on_dedicated_thread(cli: Cli) -> Result<(), LoaderError> {
    let handle = std::thread::Builder::new()
        .name("smoothloader-batch".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build per-batch Tokio runtime");
            rt.block_on(run_batch(cli))
        })
        .expect("failed to spawn batch thread");
    handle.join().unwrap_or_else(|_| Err(LoaderError::Internal("batch thread panicked".into())))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = validate_cli(&cli) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = if cli.own_thread {
        run_on_dedicated_thread(cli)
    } else {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(run_batch(cli))
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "batch run failed");
            eprintln!("smoothloader: {e}");
            ExitCode::FAILURE
        }
    }
}
