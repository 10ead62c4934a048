#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use apiguard_lib::botwatch::Watchdog;
use apiguard_lib::cache::build_cache;
use apiguard_lib::common::AnonymousUsers;
use apiguard_lib::config::{load_from_path, Config, GuardConfig, LoggingConfig};
use apiguard_lib::guard::GuardDeps;
use apiguard_lib::proxy::{spawn_report_logger, ProxyContext, RequestCounter, ServerOptions};
use apiguard_lib::storage::{MemoryTelemetryStorage, MemoryUserFinder, TelemetryStorage, UserFinder};
use apiguard_lib::telemetry::init_tracing;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "API protection gateway")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", env = "APIGUARD_CONFIG")]
    config: PathBuf,

    /// Start with empty request counters instead of the stored snapshot
    #[arg(long)]
    ignore_stored_state: bool,
}

async fn start(cli: Cli, cfg: Config) -> apiguard_lib::Result<()> {
    let user_finder: Arc<dyn UserFinder> = Arc::new(MemoryUserFinder::new());
    let telemetry: Arc<dyn TelemetryStorage> = Arc::new(MemoryTelemetryStorage::new());

    let needs_watchdog = cfg.services.iter().any(|s| matches!(s.guard, GuardConfig::Telemetry));
    let watchdog = needs_watchdog
        .then(|| Arc::new(Watchdog::start(cfg.botwatch.clone(), telemetry.clone())));

    let deps = GuardDeps {
        user_finder: Some(user_finder),
        telemetry: Some(telemetry),
        watchdog,
        anonymous_users: AnonymousUsers::new(cfg.anonymous_users.iter().copied()),
    };
    let cache = build_cache(&cfg.cache).await?;

    let counter = RequestCounter::new();
    if let Some(path) = cfg.counter_state_path.as_deref() {
        if cli.ignore_stored_state {
            info!("ignoring stored request counter state");
        } else {
            counter.load(path)?;
        }
    }
    let (counter_tx, _counter_task) = counter.start();
    let (report_tx, _report_task) = spawn_report_logger();

    let ctx = ProxyContext::new(deps, cache).with_reports(report_tx).with_counter(counter_tx);
    let opts = ServerOptions { ctx, counter: Some(counter), config_path: Some(cli.config) };
    apiguard_lib::run(Arc::new(cfg), opts).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            if let Err(e) = init_tracing(&LoggingConfig::default()) {
                eprintln!("{e}");
            }
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Err(e) = init_tracing(&cfg.logging) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    info!(?cfg.listen, services = cfg.services.len(), "configuration loaded");

    if let Err(err) = start(cli, cfg).await {
        error!(%err, "API guard exited with error");
        std::process::exit(1);
    }
}
