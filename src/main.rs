mod logger;
mod surface;

use data::{
    Config, FetchOrchestrator, Policy, SegmentCache, SurfaceRequest, SurfaceUpdate,
    config::CONFIG_FILE, fetch::now_ms,
};
use feed::auth::StaticAuth;
use iced_futures::futures::{
    StreamExt,
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use surface::Surface;

use std::sync::Arc;

fn main() {
    logger::setup(cfg!(debug_assertions)).expect("Failed to initialize logger");

    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map_or_else(
            || "unknown location".to_string(),
            |loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        );
        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::error!("PANIC at {location}: {msg}");
        eprintln!("PANIC at {location}: {msg}");
    }));

    let config = Config::load();

    if config.channels.is_empty() {
        log::error!(
            "No channels configured, add some to {}",
            data::data_path(Some(CONFIG_FILE)).display()
        );
        return;
    }

    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run(config)),
        Err(e) => log::error!("Failed to start async runtime: {e}"),
    }
}

async fn run(config: Config) {
    log::info!(
        "Streaming {} channels from {}",
        config.channels.len(),
        config.server_url
    );

    let auth = StaticAuth::new(Config::credential(|key| std::env::var(key).ok()));
    let (handle, events) = feed::transport::connect(config.transport(), auth);

    let (updates_tx, updates) = mpsc::unbounded();
    let (requests, requests_rx) = mpsc::unbounded();

    let orchestrator = FetchOrchestrator::new(
        handle,
        Arc::new(SegmentCache::new()),
        config.fetch_options(),
        updates_tx,
    );

    tokio::join!(
        orchestrator.run(requests_rx, events),
        drive_surfaces(&config, requests, updates),
    );

    log::info!("Session closed");
}

/// Feeds both surfaces: initial cache-backed load, periodic refresh ticks
/// that follow wall-clock time, and teardown on Ctrl-C. Returns once the
/// orchestrator has hung up.
async fn drive_surfaces(
    config: &Config,
    requests: UnboundedSender<SurfaceRequest>,
    mut updates: UnboundedReceiver<SurfaceUpdate>,
) {
    let now = now_ms();
    let mut surfaces = [Surface::overview(config, now), Surface::detail(config, now)];

    for surface in &surfaces {
        send_all(&requests, surface, Policy::Cache);
    }

    let mut refresh = tokio::time::interval(config.refresh_interval());
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    refresh.tick().await;

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut shutting_down = false;

    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(update) => match update.surface() {
                    Some(id) => {
                        if let Some(surface) = surfaces.iter_mut().find(|s| s.id() == id) {
                            surface.update(update);
                        }
                    }
                    None => surfaces.iter_mut().for_each(|s| s.update(update.clone())),
                },
                None => break,
            },
            _ = refresh.tick(), if !shutting_down => {
                let now = now_ms();
                for surface in &mut surfaces {
                    if surface.follow(now) {
                        log::debug!("{}: following now", surface.id());
                    }
                    send_all(&requests, surface, Policy::Refresh);
                }
            }
            result = &mut ctrl_c, if !shutting_down => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {e}");
                }
                if surfaces.iter().any(Surface::is_busy) {
                    log::info!("Shutting down, abandoning requests in flight");
                } else {
                    log::info!("Shutting down");
                }
                shutting_down = true;
                if requests.unbounded_send(SurfaceRequest::Teardown).is_err() {
                    break;
                }
            }
        }
    }
}

fn send_all(requests: &UnboundedSender<SurfaceRequest>, surface: &Surface, policy: Policy) {
    let messages = std::iter::once(surface.view_request()).chain(surface.fetch_requests(policy));

    for message in messages {
        if requests.unbounded_send(message).is_err() {
            log::warn!("{}: orchestrator stopped, request dropped", surface.id());
            return;
        }
    }
}
