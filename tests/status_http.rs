//! Integration tests for the status REST endpoints.
//!
//! Each test spins up an Axum server on a random port and queries it with
//! reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;

use ai_relay::backends::Reply;
use ai_relay::error::BackendError;
use ai_relay::roles::{RoleResolver, RoleTable};
use ai_relay::status::status_routes;
use ai_relay::worker::{
    CancelScope, CancellationContext, Dispatch, Job, ReplySink, Requester, Scheduler,
    SchedulerConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds every job until cancelled.
struct HoldDispatch {
    started: Notify,
}

#[async_trait]
impl Dispatch for HoldDispatch {
    async fn dispatch(
        &self,
        _job: &Job,
        ctx: &CancellationContext,
    ) -> Result<Option<Reply>, BackendError> {
        self.started.notify_one();
        ctx.cancelled().await;
        Ok(None)
    }
}

struct NullSink;

#[async_trait]
impl ReplySink for NullSink {
    async fn deliver(&self, _requester: &Requester, _reply: Reply) {}
    async fn deliver_failure(&self, _requester: &Requester, _notice: &str) {}
}

/// Start an Axum server on a random port, return (base url, scheduler, dispatch).
async fn start_server() -> (String, Arc<Scheduler>, Arc<HoldDispatch>) {
    let dispatch = Arc::new(HoldDispatch {
        started: Notify::new(),
    });
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(RoleResolver::new(RoleTable {
            privileged: Some("boss".into()),
            elevated: vec![],
        })),
        dispatch.clone(),
        Arc::new(NullSink),
    );
    let app = status_routes(Arc::clone(&scheduler));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), scheduler, dispatch)
}

async fn get_json(url: &str) -> Value {
    let resp = reqwest::get(url).await.unwrap();
    assert!(resp.status().is_success());
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    timeout(TEST_TIMEOUT, async {
        let (base, _scheduler, _dispatch) = start_server().await;
        let json = get_json(&format!("{base}/health")).await;
        assert_eq!(json["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_when_idle() {
    timeout(TEST_TIMEOUT, async {
        let (base, _scheduler, _dispatch) = start_server().await;
        let json = get_json(&format!("{base}/api/status")).await;

        assert_eq!(json["busy"], false);
        assert_eq!(json["queue_depth"], 0);
        assert!(json["running"].is_null());
        assert_eq!(json["accepting"], true);
        assert_eq!(json["totals"]["completed"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_shows_running_and_queued_jobs() {
    timeout(TEST_TIMEOUT, async {
        let (base, scheduler, dispatch) = start_server().await;

        let started = dispatch.started.notified();
        let ticket = scheduler
            .submit(Requester::new("telegram", "7").with_name("alice"), "first")
            .unwrap();
        started.await;
        scheduler
            .submit(Requester::new("telegram", "8"), "second")
            .unwrap();

        let json = get_json(&format!("{base}/api/status")).await;
        assert_eq!(json["busy"], true);
        assert_eq!(json["queue_depth"], 1);
        assert_eq!(json["running"]["job_id"], ticket.job_id.to_string());
        assert_eq!(json["running"]["requester"], "alice");
        assert_eq!(json["running"]["channel"], "telegram");
        assert_eq!(json["running"]["tier"], "standard");
        assert_eq!(json["running"]["cancelled"], false);

        scheduler.request_cancel(&Requester::new("cli", "boss"), CancelScope::All);
        scheduler.shutdown();
        scheduler.wait_idle().await;

        let json = get_json(&format!("{base}/api/status")).await;
        assert_eq!(json["busy"], false);
        assert_eq!(json["accepting"], false);
        assert_eq!(json["totals"]["cancelled"], 1);
    })
    .await
    .expect("test timed out");
}
