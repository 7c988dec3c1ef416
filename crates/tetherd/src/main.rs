//! tetherd: the Tether session-layer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tether_core::{Endpoint, LocalKey, TetherConfig, TransportProto};
use tether_session::{EchoApp, SessionMain};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // A broken invariant leaves worker state unusable.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(%info, "fatal invariant violation, aborting");
        std::process::abort();
    }));

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });
    tracing::info!(
        workers = config.session.workers,
        api_port = config.api.port,
        "tetherd starting"
    );

    // Session layer
    let (main, workers) = SessionMain::enable(&config.session);
    let worker_threads =
        SessionMain::spawn_workers(workers).context("failed to spawn session workers")?;

    // Echo server
    if config.echo.enabled {
        let lcl: Endpoint = config
            .echo
            .listen
            .parse()
            .with_context(|| format!("invalid echo endpoint {}", config.echo.listen))?;
        let app = main.apps().attach(Arc::new(EchoApp::new()));
        let key = LocalKey {
            proto: TransportProto::Loopback,
            fib_index: 0,
            lcl,
        };
        let listener = main
            .listen(app, key)
            .await
            .context("echo server failed to listen")?;
        tracing::info!(%lcl, %listener, app, "echo server listening");
    }

    // Shutdown broadcast
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // Periodic stats
    let stats_printer = {
        let main = main.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                for (thread, stats) in main.stats() {
                    if stats.is_clean() {
                        tracing::debug!(thread, opened = stats.sessions_opened, "worker stats");
                    } else {
                        tracing::warn!(
                            thread,
                            ctrl_rejected = stats.ctrl_rejected,
                            pool_full = stats.pool_full,
                            fifo_alloc_failures = stats.fifo_alloc_failures,
                            "worker is shedding load"
                        );
                    }
                }
            }
        })
    };

    // API server
    let api_server = {
        let state = tether_api::ApiState {
            main: main.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = tether_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_server         => tracing::error!("API server exited: {:?}", r),
        r = stats_printer      => tracing::error!("stats printer exited: {:?}", r),
    }

    main.shutdown();
    tokio::task::spawn_blocking(move || {
        for handle in worker_threads {
            if handle.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    })
    .await?;
    tracing::info!("tetherd stopped");
    Ok(())
}
