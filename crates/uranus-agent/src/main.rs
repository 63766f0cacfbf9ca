mod broker;
mod config;
mod heartbeat;
mod web;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use liburanus::{
    DispatchSettings, Dispatcher, ForwardingRegistry, HttpUpdater, SessionRegistry, SystemNginx,
    Transport,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uranus_protocol::Topics;

use crate::broker::MqttTransport;
use crate::config::{Args, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uranus_agent=info,liburanus=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;
    let topics = Topics::new(&cfg.topic_prefix, &cfg.agent_id);

    info!(
        agent_id = %cfg.agent_id,
        version = env!("CARGO_PKG_VERSION"),
        broker = ?cfg.broker_enabled.then_some(cfg.broker_url.as_str()),
        listen = ?cfg.listen,
        data_dir = %cfg.data_dir.display(),
        "uranus agent starting"
    );

    let registry = Arc::new(SessionRegistry::new());
    let forwarding = Arc::new(ForwardingRegistry::default());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&forwarding),
        Arc::new(SystemNginx::new(&cfg.nginx_pid_file)),
        Arc::new(HttpUpdater::new(&cfg.install_dir, cfg.update_url.clone())),
        topics.clone(),
        DispatchSettings {
            default_shell: cfg.default_shell.clone(),
            queue_capacity: cfg.output_queue_capacity,
            exec_timeout: cfg.exec_timeout,
            ..DispatchSettings::default()
        },
    ));

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(registry.spawn_idle_reaper(cfg.idle_check, cfg.idle_timeout, shutdown.clone()));

    if cfg.broker_enabled {
        let (mqtt, eventloop) = MqttTransport::new(&cfg.broker_url, topics.clone())?;
        let transport: Arc<dyn Transport> = mqtt.clone();

        tasks.push(tokio::spawn(mqtt.run(eventloop, shutdown.clone())));
        tasks.push(tokio::spawn(heartbeat::run_heartbeat(
            Arc::clone(&transport),
            topics.clone(),
            cfg.heartbeat_interval,
            shutdown.clone(),
        )));

        let serve = Arc::clone(&dispatcher).serve(transport, shutdown.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = serve.await {
                error!(error = %err, "command loop failed");
            }
        }));
    } else {
        info!("broker disabled");
    }

    if let Some(listen) = cfg.listen {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind web listener on {listen}"))?;
        let state = Arc::new(web::WebState {
            dispatcher: Arc::clone(&dispatcher),
        });
        let app = web::router(state, &cfg.allow_origins)?;
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = web::serve(listener, app, shutdown).await {
                error!(error = %format!("{err:#}"), "web listener stopped");
            }
        }));
    }

    wait_for_shutdown().await?;
    info!("shutting down");

    forwarding.stop_all().await;
    let closed = registry.close_all().await;
    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task failed");
        }
    }
    info!(sessions_closed = closed, "uranus agent stopped");
    Ok(())
}

/// Resolve on Ctrl+C, SIGTERM or SIGHUP. SIGHUP follows a self-update and
/// expects the service manager to start the new binary.
async fn wait_for_shutdown() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = term.recv() => info!("received SIGTERM"),
        _ = hup.recv() => info!("received SIGHUP, restarting"),
    }
    Ok(())
}
