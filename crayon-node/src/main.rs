//! Crayon Node: headless peer that shares a synthetic camera pose.
//!
//! Stands in for the rendering layer: joins the LAN session, broadcasts a
//! pose every frame, sends a sync ping whenever a new peer joins, and logs
//! everything it receives.
//!
//! Configured from the environment:
//!
//! | variable | default |
//! |----------|---------|
//! | `CRAYON_DISPLAY_NAME` | `crayon-<random>` |
//! | `CRAYON_SERVICE` | `location-share` |
//! | `CRAYON_FRAME_RATE` | `30` |
//! | `RUST_LOG` | `info` |

use log::info;
use std::time::{Duration, Instant};

use crayon_sync::{LanTransport, Pose, SessionConfig, SessionTransport, SyncCoordinator, SyncEvent};

const DEFAULT_FRAME_RATE: u32 = 30;

fn config_from_env() -> Result<(SessionConfig, u32), Box<dyn std::error::Error>> {
    let mut config = SessionConfig::default();
    if let Ok(name) = std::env::var("CRAYON_DISPLAY_NAME") {
        config.display_name = name;
    }
    if let Ok(service) = std::env::var("CRAYON_SERVICE") {
        config.service_type = service;
    }
    let frame_rate = match std::env::var("CRAYON_FRAME_RATE") {
        Ok(rate) => rate
            .parse::<u32>()
            .ok()
            .filter(|r| (1..=240).contains(r))
            .ok_or_else(|| format!("CRAYON_FRAME_RATE must be 1-240, got {rate:?}"))?,
        Err(_) => DEFAULT_FRAME_RATE,
    };
    config.validate()?;
    Ok((config, frame_rate))
}

/// Camera slowly orbiting the origin at head height.
fn orbit_pose(elapsed: Duration) -> Pose {
    let angle = elapsed.as_secs_f32() * 0.5;
    let (sin, cos) = angle.sin_cos();
    Pose::from_columns([
        [cos, 0.0, -sin, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [sin, 0.0, cos, 0.0],
        [2.0 * sin, 1.6, 2.0 * cos, 1.0],
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, frame_rate) = config_from_env()?;
    info!(
        "Starting {} on service {:?} at {frame_rate} fps",
        config.display_name, config.service_type
    );

    let (coordinator, mut events) = SyncCoordinator::new(LanTransport::new(config)?);
    coordinator.start()?;

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / frame_rate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut peer_count = 0;
    let mut frames: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                coordinator.broadcast_pose(orbit_pose(started.elapsed()));
                frames += 1;
                if frames % (u64::from(frame_rate) * 10) == 0 {
                    log::debug!("{frames} frames, {:?}", coordinator.transport().stats());
                }
            }
            event = events.recv() => match event {
                Some(SyncEvent::RosterChanged(roster)) => {
                    info!("Peers: {roster:?}");
                    if roster.len() > peer_count {
                        coordinator.broadcast_sync(orbit_pose(started.elapsed()));
                    }
                    peer_count = roster.len();
                }
                Some(SyncEvent::PoseUpdate { from, pose }) => {
                    log::trace!("Pose from {from}: translation {:?}", pose.translation());
                }
                Some(SyncEvent::SyncReceived { from, pose }) => {
                    info!("Sync from {from}: origin at {:?}", pose.translation());
                }
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("Shutting down");
                break;
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}
