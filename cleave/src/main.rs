use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cleave::adapter::Adapter;
use cleave::cli::Cli;
use cleave::engine::Engine;
use cleave::error::Result;
use cleave::runtime::conf::Conf;
use cleave::runtime::reload::{ConfigWatcher, ReloadTrigger};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::load(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(conf.log_level.to_string().to_lowercase())),
        )
        .init();

    info!(
        event.name = "cleave.starting",
        split_mode = %conf.engine.split_mode,
        workers = conf.engine.workers,
        auto_reload = conf.auto_reload,
    );

    let adapter = build_adapter(&conf)?;
    let engine = Arc::new(Engine::new(conf.engine.clone(), adapter));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    if conf.auto_reload || cli.config.is_some() {
        spawn_reload_loop(engine.clone(), &cli, conf.auto_reload)?;
    }

    let result = engine.run(shutdown).await;
    match &result {
        Ok(()) => info!(event.name = "cleave.stopped"),
        Err(e) => error!(event.name = "cleave.failed", error.message = %e),
    }
    result.map_err(Into::into)
}

#[cfg(all(target_os = "linux", feature = "nfqueue"))]
fn build_adapter(conf: &Conf) -> Result<Arc<dyn Adapter>> {
    let adapter = cleave::adapter::nfqueue::NfqueueAdapter::new(&conf.nfqueue)?;
    info!(
        event.name = "adapter.nfqueue_ready",
        queue_num = conf.nfqueue.queue_num,
        mark = conf.nfqueue.mark,
    );
    Ok(Arc::new(adapter))
}

#[cfg(all(target_os = "windows", feature = "windivert"))]
fn build_adapter(conf: &Conf) -> Result<Arc<dyn Adapter>> {
    let adapter = cleave::adapter::windivert::WinDivertAdapter::new(&conf.windivert)?;
    info!(event.name = "adapter.windivert_ready");
    Ok(Arc::new(adapter))
}

#[cfg(all(target_os = "freebsd", feature = "pf-divert"))]
fn build_adapter(conf: &Conf) -> Result<Arc<dyn Adapter>> {
    let adapter = cleave::adapter::divert::DivertAdapter::new(&conf.divert)?;
    info!(
        event.name = "adapter.divert_ready",
        port = conf.divert.port,
    );
    Ok(Arc::new(adapter))
}

#[cfg(not(any(
    all(target_os = "linux", feature = "nfqueue"),
    all(target_os = "windows", feature = "windivert"),
    all(target_os = "freebsd", feature = "pf-divert")
)))]
fn build_adapter(_conf: &Conf) -> Result<Arc<dyn Adapter>> {
    warn!(
        event.name = "adapter.stub_selected",
        "no capture backend was built in; packets will not be intercepted"
    );
    Ok(Arc::new(cleave::adapter::StubAdapter::new()))
}

/// SIGINT/SIGTERM cancel the engine; the engine then drives its own
/// fail-open shutdown sequence.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!(event.name = "cleave.shutdown_signal");
            shutdown.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(event.name = "cleave.shutdown_signal");
            shutdown.cancel();
        });
    }
    Ok(())
}

/// Re-extract the configuration on SIGHUP or file change and apply it to
/// the running engine. Topology changes are rejected and logged; the old
/// configuration stays active.
fn spawn_reload_loop(engine: Arc<Engine>, cli: &Cli, watch_file: bool) -> Result<()> {
    let watch_path = if watch_file { cli.config.clone() } else { None };
    let mut watcher = ConfigWatcher::new(watch_path.as_deref())?;
    let cli = cli.clone();
    tokio::spawn(async move {
        while let Some(trigger) = watcher.next().await {
            match trigger {
                ReloadTrigger::Sighup => info!(event.name = "cleave.reload", source = "sighup"),
                ReloadTrigger::FileChanged(path) => {
                    info!(event.name = "cleave.reload", source = "file", path = %path.display());
                }
            }
            let new_conf = match Conf::load(&cli) {
                Ok(c) => c,
                Err(e) => {
                    warn!(event.name = "cleave.reload_rejected", error.message = %e);
                    continue;
                }
            };
            if let Err(e) = engine.reload(new_conf.engine) {
                warn!(event.name = "cleave.reload_rejected", error.message = %e);
            }
        }
    });
    Ok(())
}
