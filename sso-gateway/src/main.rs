//! sso-gateway: authenticated reverse proxy for backend web apps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sso_gateway::auth::OidcProvider;
use sso_gateway::{build_router, AppState, Cli, MemorySessionStore};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const SESSION_GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = cli.into_config().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr,
        apps = ?config.registry.names(),
        "starting sso-gateway"
    );
    if config.policy.is_deny_all() {
        warn!("neither ALLOWED_EMAILS nor ALLOWED_DOMAIN is set; every login will be denied");
    }

    let provider = OidcProvider::new(
        reqwest::Client::new(),
        config.oidc.client_id.clone(),
        config.oidc.client_secret.clone(),
        config.oidc.endpoints.clone(),
    );
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let sessions = Arc::new(MemorySessionStore::new());

    // Sessions whose cookie never comes back are only reclaimed here.
    let gc_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_GC_INTERVAL);
        loop {
            interval.tick().await;
            let purged = gc_sessions.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = gc_sessions.len(), "purged expired sessions");
            }
        }
    });

    let bind_addr = config.bind_addr.clone();
    let state = AppState::from_config(config, sessions, Arc::new(provider))?
        .with_metrics(metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("sso-gateway stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("received shutdown signal");
}
