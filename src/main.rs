//! Prediction demo - one authoritative server and several predicting clients
//!
//! Everything runs in one process on a single-threaded runtime. Messages go
//! through a simulated network that delays, reorders and drops them, so the
//! clients have to predict and reconcile. A JSON summary comparing each
//! client's predicted ball with the server's is printed at the end.

mod demo;

use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use csp_netcode::config::{Config, LogFormat};
use csp_netcode::util::time::{interval_for, Timer};

use crate::demo::Demo;

/// Seconds to keep running after the deadline so in-flight messages land
const SETTLE_SECS: u32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_format);

    info!(
        clients = config.demo.clients,
        duration_secs = config.demo.duration_secs,
        update_fps = config.update_fps,
        physics_fps = config.physics_fps,
        "Starting prediction demo"
    );

    let mut demo = Demo::new(&config);
    let dt = interval_for(config.physics_fps);
    let timer = Timer::new();

    let mut ticker = interval(Duration::from_secs_f32(dt));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let deadline = sleep(Duration::from_secs(config.demo.duration_secs));
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => demo.step(dt, true),
            _ = &mut deadline => {
                info!("Demo duration elapsed");
                break;
            }
            _ = &mut shutdown => break,
        }
    }

    demo.settle(dt, SETTLE_SECS * config.physics_fps);

    let summary = demo.summary();
    info!(
        frames = summary.frames,
        elapsed_ms = timer.elapsed_ms(),
        "Demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // stdout carries the summary
    match format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Resolves on the first Ctrl+C, or SIGTERM on unix, so the demo can still
/// settle and print its summary
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C listener unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM listener unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = interrupt => "interrupt",
        _ = terminate => "terminate",
    };
    info!(signal, "Interrupted, settling session before summary");
}
