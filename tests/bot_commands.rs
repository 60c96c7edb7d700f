//! Bot command handling against a live scheduler with a stub backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use ai_relay::backends::{Reply, RoutingPolicy};
use ai_relay::bot::{Bot, BotDeps};
use ai_relay::channels::{ChannelManager, IncomingMessage};
use ai_relay::config::BotConfig;
use ai_relay::error::BackendError;
use ai_relay::roles::{RoleResolver, RoleTable};
use ai_relay::sessions::SessionStore;
use ai_relay::worker::{
    CancellationContext, Dispatch, Job, ReplySink, Requester, Scheduler, SchedulerConfig,
};

const WAIT: Duration = Duration::from_secs(5);

/// Blocks each job until released or cancelled.
struct GatedDispatch {
    started: mpsc::UnboundedSender<String>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Dispatch for GatedDispatch {
    async fn dispatch(
        &self,
        job: &Job,
        ctx: &CancellationContext,
    ) -> Result<Option<Reply>, BackendError> {
        let _ = self.started.send(job.text.clone());
        tokio::select! {
            _ = ctx.cancelled() => return Ok(None),
            permit = self.gate.acquire() => {
                if let Ok(p) = permit {
                    p.forget();
                }
            }
        }
        Ok(Some(Reply::new("", format!("re: {}", job.text), "stub")))
    }
}

#[derive(Default)]
struct CollectSink {
    replies: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ReplySink for CollectSink {
    async fn deliver(&self, requester: &Requester, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .push((requester.id.clone(), reply.body));
    }

    async fn deliver_failure(&self, requester: &Requester, notice: &str) {
        self.replies
            .lock()
            .unwrap()
            .push((requester.id.clone(), notice.to_string()));
    }
}

struct Fixture {
    bot: Bot,
    scheduler: Arc<Scheduler>,
    sink: Arc<CollectSink>,
    started: mpsc::UnboundedReceiver<String>,
    gate: Arc<Semaphore>,
    dir: tempfile::TempDir,
}

async fn fixture(max_queue_depth: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let roles = RoleResolver::load(
        dir.path().join("roles.json"),
        RoleTable {
            privileged: Some("boss".into()),
            elevated: vec!["mod".into()],
        },
    )
    .await
    .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let sink = Arc::new(CollectSink::default());
    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_queue_depth,
            ..SchedulerConfig::default()
        },
        Arc::new(roles),
        Arc::new(GatedDispatch {
            started: tx,
            gate: Arc::clone(&gate),
        }),
        sink.clone(),
    );

    let bot = Bot::new(
        BotConfig::default(),
        BotDeps {
            scheduler: Arc::clone(&scheduler),
            channels: Arc::new(ChannelManager::new()),
            sessions: Arc::new(SessionStore::new(dir.path().join("sessions"))),
            routing: RoutingPolicy::default(),
        },
    );

    Fixture {
        bot,
        scheduler,
        sink,
        started: rx,
        gate,
        dir,
    }
}

fn msg(user: &str, text: &str) -> IncomingMessage {
    IncomingMessage::new("test", user, text)
}

impl Fixture {
    async fn say(&self, user: &str, text: &str) -> Option<String> {
        self.bot.handle_message(&msg(user, text)).await.unwrap()
    }

    async fn next_started(&mut self) -> String {
        tokio::time::timeout(WAIT, self.started.recv())
            .await
            .expect("no job started")
            .unwrap()
    }

    async fn idle(&self) {
        tokio::time::timeout(WAIT, self.scheduler.wait_idle())
            .await
            .expect("scheduler did not go idle");
    }
}

#[tokio::test]
async fn request_runs_without_immediate_answer() {
    let mut f = fixture(32).await;
    assert_eq!(f.say("alice", "what is rust?").await, None);
    assert_eq!(f.next_started().await, "what is rust?");

    f.gate.add_permits(1);
    f.idle().await;
    assert_eq!(
        *f.sink.replies.lock().unwrap(),
        vec![("alice".to_string(), "re: what is rust?".to_string())]
    );
}

#[tokio::test]
async fn second_request_is_told_its_position() {
    let mut f = fixture(32).await;
    f.say("alice", "one").await;
    f.next_started().await;

    assert_eq!(
        f.say("bob", "two").await.as_deref(),
        Some("Your request is queued (1 ahead of you).")
    );
    assert_eq!(
        f.say("carol", "three").await.as_deref(),
        Some("Your request is queued (2 ahead of you).")
    );

    f.gate.add_permits(3);
    f.idle().await;
    assert_eq!(f.sink.replies.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn privileged_request_interrupts() {
    let mut f = fixture(32).await;
    f.say("alice", "slow").await;
    f.next_started().await;

    assert_eq!(
        f.say("boss", "urgent").await.as_deref(),
        Some("Interrupting the current request; yours is next.")
    );
    assert_eq!(f.next_started().await, "urgent");

    f.gate.add_permits(1);
    f.idle().await;
    assert_eq!(
        *f.sink.replies.lock().unwrap(),
        vec![("boss".to_string(), "re: urgent".to_string())]
    );
}

#[tokio::test]
async fn stop_commands_report_outcome() {
    let mut f = fixture(32).await;
    assert_eq!(
        f.say("alice", "/stop").await.as_deref(),
        Some("You have no running request.")
    );
    assert_eq!(
        f.say("boss", "/stop all").await.as_deref(),
        Some("Nothing is running.")
    );

    f.say("alice", "long job").await;
    f.next_started().await;

    assert_eq!(
        f.say("bob", "/stop").await.as_deref(),
        Some("You have no running request.")
    );
    assert_eq!(
        f.say("mod", "/STOP   ALL").await.as_deref(),
        Some("mod cannot stop active processes.")
    );
    assert_eq!(
        f.say("alice", "/cancel").await.as_deref(),
        Some("Stopping your request.")
    );
    f.idle().await;
    assert!(f.sink.replies.lock().unwrap().is_empty());

    f.say("bob", "another").await;
    f.next_started().await;
    assert_eq!(
        f.say("boss", "/stopall").await.as_deref(),
        Some("Stopping the running request.")
    );
    f.idle().await;
    assert!(f.sink.replies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sandbox_prefix_is_checked_before_queueing() {
    let f = fixture(32).await;
    assert_eq!(
        f.say("alice", "local ls -la").await.as_deref(),
        Some("Only elevated users and above can use local commands.")
    );
    assert_eq!(
        f.say("mod", "local").await.as_deref(),
        Some("Please add a prompt after local.")
    );
    assert!(!f.scheduler.is_busy());
    assert_eq!(f.scheduler.queue_depth(), 0);
}

#[tokio::test]
async fn empty_request_is_rejected() {
    let f = fixture(32).await;
    assert_eq!(
        f.say("alice", "   ").await.as_deref(),
        Some("Please include a request.")
    );
    assert!(!f.scheduler.is_busy());
}

#[tokio::test]
async fn full_queue_is_reported() {
    let mut f = fixture(1).await;
    f.say("alice", "running").await;
    f.next_started().await;
    f.say("bob", "waiting").await;

    assert_eq!(
        f.say("carol", "overflow").await.as_deref(),
        Some("The queue is full right now. Please try again later.")
    );

    f.gate.add_permits(2);
    f.idle().await;
}

#[tokio::test]
async fn requests_after_shutdown_are_refused() {
    let f = fixture(32).await;
    f.scheduler.shutdown();
    assert_eq!(
        f.say("alice", "hello?").await.as_deref(),
        Some("Shutting down, not accepting new requests.")
    );
}

#[tokio::test]
async fn status_reflects_scheduler() {
    let mut f = fixture(32).await;
    let idle = f.say("alice", "/status").await.unwrap();
    assert!(idle.starts_with("Relay status: idle"));
    assert!(idle.contains("Running: nothing"));

    f.say("mod", "job").await;
    f.next_started().await;
    f.say("alice", "queued").await;

    let busy = f.say("alice", "/status").await.unwrap();
    assert!(busy.starts_with("Relay status: busy"));
    assert!(busy.contains("Running: mod (elevated)"));
    assert!(busy.contains("Queued: 1"));

    f.gate.add_permits(2);
    f.idle().await;
    let done = f.say("alice", "/status").await.unwrap();
    assert!(done.contains("Finished: 2 completed, 0 cancelled, 0 failed, 0 timed out"));
}

#[tokio::test]
async fn new_session_creates_directory() {
    let f = fixture(32).await;
    assert_eq!(
        f.say("alice", "/new").await.as_deref(),
        Some("Started a new session.")
    );

    let sessions = f.dir.path().join("sessions");
    let created: Vec<_> = std::fs::read_dir(&sessions)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(created.len(), 1);
    assert!(created[0].starts_with("alice_"));
}

#[tokio::test]
async fn reload_is_privileged_only() {
    let f = fixture(32).await;
    assert_eq!(
        f.say("mod", "/reload").await.as_deref(),
        Some("Only the privileged user can reload roles.")
    );

    std::fs::write(
        f.dir.path().join("roles.json"),
        r#"{"privileged": "boss", "elevated": ["alice"]}"#,
    )
    .unwrap();
    assert_eq!(
        f.say("boss", "/reload roles").await.as_deref(),
        Some("Role table reloaded.")
    );

    // alice may now use the sandbox prefix; it passes the pre-check.
    assert_ne!(
        f.say("alice", "local ls").await.as_deref(),
        Some("Only elevated users and above can use local commands.")
    );
    f.scheduler.shutdown();
    f.idle().await;
}

#[tokio::test]
async fn help_lists_commands() {
    let f = fixture(32).await;
    let help = f.say("alice", "/help").await.unwrap();
    assert!(help.contains("/stop all"));
    assert!(help.contains("local <prompt>"));
}
