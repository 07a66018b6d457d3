use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use easarchive_server::alert_watcher::AlertWatcher;
use easarchive_server::client::Monitor;
use easarchive_server::monitoring::{HubLogger, MonitoringHub};
use easarchive_server::web::Web;
use easarchive_server::{Cli, Command, MonitorArgs, ServeArgs, Session, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.verbose.log_level_filter();

    match cli.command {
        Command::Serve(args) => serve(args, level).await,
        Command::Monitor(args) => monitor(args, level).await,
    }
}

async fn serve(args: ServeArgs, level: log::LevelFilter) -> Result<()> {
    let hub = Arc::new(MonitoringHub::new(Session::hub_config(&args)));
    let logger = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .build();
    HubLogger::new(logger, hub.clone())
        .init()
        .into_diagnostic()?;

    log::info!("easarchive-server {} starting", VERSION);
    let session = Session::new(args, hub).into_diagnostic()?;

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("AlertWatcher", {
            let watcher = AlertWatcher::new(session.clone());
            |a| watcher.run(a)
        }));
        s.start(SubsystemBuilder::new("Web", |a| Web::new(session).run(a)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}

async fn monitor(args: MonitorArgs, level: log::LevelFilter) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    log::info!("easarchive-server {} monitor starting", VERSION);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("Monitor", |a| Monitor::new(args).run(a)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
