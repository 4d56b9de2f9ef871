//! imgoverlay host
//!
//! Runs the overlay control server on its own, pumping it once per frame
//! and logging the texture work a compositor would perform.

use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgoverlay::{Config, ControlServer, PresentTracker, PumpEvent, drawable};

/// Server plus presentation state, driven from the frame tick
struct OverlayHost {
    server: ControlServer,
    tracker: PresentTracker,
    no_display: bool,
}

impl OverlayHost {
    fn new(config: &Config) -> Self {
        Self {
            server: ControlServer::new(config.endpoint(), config.limits()),
            tracker: PresentTracker::new(),
            no_display: config.host.no_display,
        }
    }

    /// One frame: pump the control channel, then diff the registry
    fn frame(&mut self) {
        match self.server.pump() {
            PumpEvent::Idle => {}
            event => debug!("Pump: {:?}", event),
        }

        let snapshot = self.server.registry().snapshot();
        for action in self.tracker.update(&snapshot, self.no_display) {
            debug!("Present: {:?}", action);
        }

        let visible = drawable(&snapshot, self.no_display);
        if !visible.is_empty() {
            debug!("Drawing {} image(s)", visible.len());
        }
    }

    async fn run(&mut self, frame_interval: Duration) {
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.frame();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "imgoverlay=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting imgoverlay host");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }
    };

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Handle SIGTERM and SIGINT
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    let frame_interval = Duration::from_millis(config.host.frame_interval_ms.max(1));
    let mut host = OverlayHost::new(&config);

    tokio::select! {
        _ = host.run(frame_interval) => {}
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, cleaning up...");
        }
    }

    // Dropping the server releases all images and removes the socket
    drop(host);
    Ok(())
}
