//! Scheduler status: text summary, periodic publishing to channels and
//! REST endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::task::JoinHandle;

use crate::channels::ChannelManager;
use crate::worker::scheduler::{Scheduler, SchedulerStatus};

/// Human-readable status block used by `/status` and the status panel.
pub fn render_summary(status: &SchedulerStatus) -> String {
    let state = if !status.accepting {
        "shutting down"
    } else if status.busy {
        "busy"
    } else {
        "idle"
    };

    let mut lines = vec![format!("Relay status: {state}")];

    match status.running {
        Some(ref running) => {
            let stopping = if running.cancelled { ", stopping" } else { "" };
            lines.push(format!(
                "Running: {} ({}{stopping}) since {}",
                running.requester,
                running.tier,
                running.started_at.format("%H:%M:%S UTC")
            ));
        }
        None => lines.push("Running: nothing".to_string()),
    }

    lines.push(format!("Queued: {}", status.queue_depth));

    let t = &status.totals;
    lines.push(format!(
        "Finished: {} completed, {} cancelled, {} failed, {} timed out",
        t.completed, t.cancelled, t.failed, t.timed_out
    ));

    lines.join("\n")
}

/// Publish the scheduler status to every channel on a fixed interval.
pub fn spawn_status_ticker(
    scheduler: Arc<Scheduler>,
    channels: Arc<ChannelManager>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            channels.publish_status(&scheduler.snapshot()).await;
        }
    })
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/status
///
/// Current scheduler snapshot: busy flag, queue depth, running job and
/// outcome totals.
async fn get_status(State(scheduler): State<Arc<Scheduler>>) -> impl IntoResponse {
    Json(scheduler.snapshot())
}

/// Build the status REST routes.
pub fn status_routes(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .with_state(scheduler)
}
