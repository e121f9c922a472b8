use clap::Parser;
use kubeshell::build_router;
use kubeshell::cluster::kube::KubeClient;
use kubeshell::cluster::kubeconfig::ClusterConfig;
use kubeshell::cluster::ClusterApi;
use kubeshell::config::Settings;
use kubeshell::reaper::{IdleSessionSweeper, Reaper};
use kubeshell::sandbox::SandboxManager;
use kubeshell::service::ShellService;
use kubeshell::session::SessionRegistry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    let _guard = init_tracing(&settings.log_dir);

    run_server(settings).await
}

fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "kubeshell-server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
        return;
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let cluster = ClusterConfig::infer(settings.kubeconfig.as_deref())?;
    let namespace = settings.namespace(&cluster);
    tracing::info!(server = %cluster.server, namespace = %namespace, "connecting to cluster");
    let api: Arc<dyn ClusterApi> = Arc::new(KubeClient::new(&cluster, &namespace)?);

    let sandboxes = Arc::new(SandboxManager::new(
        api.clone(),
        settings.sandbox_config(),
        settings.lifecycle_timings(),
    )?);
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let reaper = Reaper::new(
        sandboxes.clone(),
        settings.reap_interval(),
        settings.reap_timeout(),
    )
    .spawn(shutdown.clone());
    let sweeper = IdleSessionSweeper::new(
        registry.clone(),
        sandboxes.clone(),
        settings.session_idle_timeout(),
        settings.reap_interval(),
    )
    .spawn(shutdown.clone());

    let service = ShellService::new(
        registry,
        sandboxes,
        api,
        settings.service_options(&namespace),
        shutdown.clone(),
    );
    let app = build_router(Arc::new(service));

    let addr = SocketAddr::new(parse_bind_ip(&settings.bind), settings.port);
    let retry_delay = Duration::from_secs(5);

    while !shutdown.is_cancelled() {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!("kubeshell-server listening on http://{}", addr);
                match axum::serve(listener, app.clone())
                    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("server shut down gracefully");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(?error, "server error; restarting");
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, %addr, "failed to bind listener");
            }
        }

        tracing::info!(
            "retrying server startup in {} seconds",
            retry_delay.as_secs()
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(retry_delay) => {}
        }
    }

    shutdown.cancel();
    let _ = tokio::join!(reaper, sweeper);
    Ok(())
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
