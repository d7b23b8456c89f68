use std::sync::Arc;
use std::time::Duration;

use aki_launcher_service::caching::CachingService;
use aki_launcher_service::config::{Config, SharedConfig};
use aki_launcher_service::notify::{Notifier, TracingNotifier};
use aki_launcher_service::process::{
    AkiServerService, ProcessService, RunningState, TarkovClientService,
};
use aki_launcher_service::requests::HttpServerRequester;
use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// How long the cache flush may take once the launcher shuts down.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state of a launcher run.
struct Launcher {
    config: SharedConfig,
    caches: CachingService,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
}

impl Launcher {
    /// Sets up caches and the shutdown signal. Must be called from within the runtime.
    fn new(config: Config) -> Result<Self> {
        let caches = CachingService::from_config(&config).context("failed to set up caches")?;
        caches.start_eviction();

        let shutdown = CancellationToken::new();
        let on_interrupt = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt, shutting down");
            }
            on_interrupt.cancel();
        });

        Ok(Self {
            config: SharedConfig::new(config),
            caches,
            notifier: Arc::new(TracingNotifier),
            shutdown,
        })
    }

    /// Cancels the shutdown token and waits for the caches to be flushed.
    async fn finish(self) {
        let hook = self.caches.spawn_shutdown_hook(self.shutdown.clone());
        self.shutdown.cancel();
        if tokio::time::timeout(FLUSH_TIMEOUT, hook).await.is_err() {
            tracing::warn!("Timed out flushing caches");
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("aki-launcher")
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
}

/// Starts the server and prints its output until it exits or the launcher is interrupted.
pub fn run_server(config: Config, args: Vec<String>) -> Result<()> {
    runtime()?.block_on(async move {
        let launcher = Launcher::new(config)?;
        let connect_window = launcher.config.get().server.connect_window;
        let requester = Arc::new(
            HttpServerRequester::new(connect_window).context("failed to set up the HTTP client")?,
        );
        let server = AkiServerService::new(
            launcher.config.clone(),
            requester,
            launcher.notifier.clone(),
        );

        if server.is_unhandled_instance_running() {
            tracing::warn!("Another server instance is already running");
        }

        let mut output = server.subscribe_output();
        let mut started = server.subscribe_started();
        let mut states = server.subscribe();
        let result = server.start(&args).context("failed to start the server");

        if result.is_ok() {
            loop {
                tokio::select! {
                    line = output.recv() => match line {
                        Ok(line) => println!("{line}"),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Skipped {} lines of server output", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    Ok(event) = started.recv() => {
                        tracing::info!(
                            "Server accepts requests at {} (ping {:?})",
                            event.address,
                            event.ping,
                        );
                    }
                    state = states.recv() => match state {
                        Ok(state) if !state.is_active() => {
                            if state == RunningState::StoppedUnexpectedly {
                                tracing::error!("Server stopped unexpectedly");
                            }
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = launcher.shutdown.cancelled() => {
                        server.stop().await;
                        break;
                    }
                }
            }
        }

        launcher.finish().await;
        result
    })
}

/// Launches the client and waits for it to exit.
///
/// With `close_after_launch` set, the launcher returns as soon as the client is spawned.
pub fn run_client(config: Config, args: Vec<String>) -> Result<()> {
    runtime()?.block_on(async move {
        let launcher = Launcher::new(config)?;
        let client = TarkovClientService::new(
            launcher.config.clone(),
            launcher.notifier.clone(),
            launcher.shutdown.clone(),
        );

        if client.is_unhandled_instance_running() {
            tracing::warn!("The client is already running outside of the launcher");
        }

        let mut states = client.subscribe();
        let result = client.start(&args).context("failed to launch the client");

        if result.is_ok() && !launcher.shutdown.is_cancelled() {
            loop {
                tokio::select! {
                    state = states.recv() => match state {
                        Ok(RunningState::StoppedUnexpectedly) => {
                            tracing::warn!("Client exited");
                            break;
                        }
                        Ok(RunningState::NotRunning) | Err(RecvError::Closed) => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                    },
                    _ = launcher.shutdown.cancelled() => {
                        if client.state().is_active() {
                            client.stop().await;
                        }
                        break;
                    }
                }
            }
        }

        launcher.finish().await;
        result
    })
}
