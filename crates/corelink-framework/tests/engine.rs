//! Integration tests: transaction engine scheduling and routing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use corelink_framework::{
    EngineConfig, FrameworkError, Message, MessageId, SessionId, TransactionEngine,
    TransactionExecutor,
};
use tokio::sync::{mpsc, oneshot};

const REQUEST_SLOW: MessageId = MessageId::new(1, 0x40, 0);
const REQUEST_WAIT: MessageId = MessageId::new(2, 0x40, 0);
const REQUEST_FAIL: MessageId = MessageId::new(3, 0x40, 0);
const REQUEST_UNBOUND: MessageId = MessageId::new(9, 0x40, 0);
const KEY_LABEL: u32 = 100;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Sleeps, then records the request label.
struct SlowExecutor {
    delay: Duration,
    finished: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl TransactionExecutor for SlowExecutor {
    async fn execute(
        &self,
        _session: SessionId,
        request: Message,
        _inbound: mpsc::Receiver<Message>,
        _terminate: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        let label = request.get_string(KEY_LABEL)?.to_string();
        self.finished.lock().unwrap().push(label);
        Ok(())
    }
}

/// Announces its session, then waits for one pushed message or the
/// termination signal.
struct WaitingExecutor {
    sessions: mpsc::UnboundedSender<SessionId>,
    received: mpsc::UnboundedSender<(SessionId, String)>,
}

#[async_trait::async_trait]
impl TransactionExecutor for WaitingExecutor {
    async fn execute(
        &self,
        session: SessionId,
        _request: Message,
        mut inbound: mpsc::Receiver<Message>,
        terminate: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        self.sessions.send(session)?;
        tokio::select! {
            biased;
            _ = terminate => {
                self.received.send((session, "terminated".to_string()))?;
            }
            msg = inbound.recv() => {
                let msg = msg.ok_or_else(|| anyhow::anyhow!("inbound closed"))?;
                let label = msg.get_string(KEY_LABEL)?.to_string();
                self.received.send((session, label))?;
            }
        }
        Ok(())
    }
}

struct FailingExecutor;

#[async_trait::async_trait]
impl TransactionExecutor for FailingExecutor {
    async fn execute(
        &self,
        session: SessionId,
        _request: Message,
        _inbound: mpsc::Receiver<Message>,
        _terminate: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        if session % 2 == 1 {
            panic!("executor panic in session {session}");
        }
        anyhow::bail!("executor error in session {session}")
    }
}

fn labelled(id: MessageId, label: &str) -> Message {
    let mut msg = Message::new(id);
    msg.set_string(KEY_LABEL, label);
    msg
}

fn to_session(session: SessionId, label: &str) -> Message {
    let mut msg = labelled(REQUEST_WAIT, label);
    msg.set_to_session(session);
    msg
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn waiting_engine(
    sessions: u32,
) -> (
    TransactionEngine,
    mpsc::UnboundedReceiver<SessionId>,
    mpsc::UnboundedReceiver<(SessionId, String)>,
) {
    let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let engine = TransactionEngine::new(EngineConfig::new().session_count(sessions));
    engine
        .register_executor(
            REQUEST_WAIT,
            Arc::new(WaitingExecutor {
                sessions: sessions_tx,
                received: received_tx,
            }),
        )
        .unwrap();
    (engine, sessions_rx, received_rx)
}

#[tokio::test]
async fn tasks_complete_in_invocation_order() {
    init_tracing();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let engine = TransactionEngine::default();
    engine
        .register_executor(
            REQUEST_SLOW,
            Arc::new(SlowExecutor {
                delay: Duration::from_secs(1),
                finished: finished.clone(),
            }),
        )
        .unwrap();
    engine.start().unwrap();

    engine.invoke_task(labelled(REQUEST_SLOW, "A")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.invoke_task(labelled(REQUEST_SLOW, "B")).await.unwrap();

    wait_until(|| finished.lock().unwrap().len() == 2).await;
    assert_eq!(*finished.lock().unwrap(), vec!["A", "B"]);
    wait_until(|| engine.stats().completed.get() == 2).await;
    assert_eq!(engine.stats().allocated.get(), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn invoke_without_executor_is_rejected() {
    init_tracing();
    let engine = TransactionEngine::default();
    engine.start().unwrap();
    let result = engine.invoke_task(Message::new(REQUEST_UNBOUND)).await;
    assert!(matches!(result, Err(FrameworkError::NoExecutor(id)) if id == REQUEST_UNBOUND));
    assert_eq!(engine.stats().invoked.get(), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn invoke_preconditions() {
    init_tracing();
    let (engine, _sessions, _received) = waiting_engine(4);

    // Not started yet.
    let result = engine.invoke_task(labelled(REQUEST_WAIT, "early")).await;
    assert!(matches!(result, Err(FrameworkError::EngineStopped)));

    engine.start().unwrap();
    let mut preset = labelled(REQUEST_WAIT, "preset");
    preset.set_to_session(3);
    assert!(matches!(
        engine.invoke_task(preset).await,
        Err(FrameworkError::SessionPreset(3))
    ));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn registration_only_before_start() {
    init_tracing();
    let (engine, _sessions, _received) = waiting_engine(4);
    let (tx, _) = mpsc::unbounded_channel();
    let (rx_tx, _) = mpsc::unbounded_channel();
    let duplicate = Arc::new(WaitingExecutor {
        sessions: tx,
        received: rx_tx,
    });
    assert!(matches!(
        engine.register_executor(REQUEST_WAIT, duplicate.clone()),
        Err(FrameworkError::DuplicateExecutor(_))
    ));

    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(FrameworkError::EngineRunning)));
    assert!(matches!(
        engine.register_executor(REQUEST_SLOW, duplicate),
        Err(FrameworkError::EngineRunning)
    ));
    engine.stop().await.unwrap();
    assert!(matches!(
        engine.stop().await,
        Err(FrameworkError::EngineStopped)
    ));
}

#[tokio::test]
async fn push_routes_to_the_right_session() {
    init_tracing();
    let (engine, mut sessions, mut received) = waiting_engine(8);
    engine.start().unwrap();

    engine.invoke_task(labelled(REQUEST_WAIT, "first")).await.unwrap();
    engine.invoke_task(labelled(REQUEST_WAIT, "second")).await.unwrap();
    let a = sessions.recv().await.unwrap();
    let b = sessions.recv().await.unwrap();
    assert_ne!(a, b);

    engine.push_message(to_session(b, "for-b")).await.unwrap();
    engine.push_message(to_session(a, "for-a")).await.unwrap();

    let mut got = vec![received.recv().await.unwrap(), received.recv().await.unwrap()];
    got.sort();
    let mut want = vec![(a, "for-a".to_string()), (b, "for-b".to_string())];
    want.sort();
    assert_eq!(got, want);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn excess_invocations_are_dropped_then_service_resumes() {
    init_tracing();
    let (engine, mut sessions, mut received) = waiting_engine(2);
    engine.start().unwrap();

    for label in ["one", "two", "three"] {
        engine.invoke_task(labelled(REQUEST_WAIT, label)).await.unwrap();
    }
    let first = sessions.recv().await.unwrap();
    let second = sessions.recv().await.unwrap();
    wait_until(|| engine.stats().dropped.get() == 1).await;
    assert_eq!(engine.stats().allocated.get(), 2);

    // Dropped work is never retried.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sessions.try_recv().is_err());

    engine.push_message(to_session(first, "done")).await.unwrap();
    received.recv().await.unwrap();
    wait_until(|| engine.stats().allocated.get() == 1).await;

    engine.invoke_task(labelled(REQUEST_WAIT, "four")).await.unwrap();
    let reused = sessions.recv().await.unwrap();
    assert_eq!(reused, first);

    engine.push_message(to_session(second, "done")).await.unwrap();
    engine.push_message(to_session(reused, "done")).await.unwrap();
    wait_until(|| engine.stats().completed.get() == 3).await;
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn push_to_unallocated_session_fails() {
    init_tracing();
    let (engine, mut sessions, mut received) = waiting_engine(4);
    engine.start().unwrap();

    assert!(matches!(
        engine.push_message(to_session(0, "x")).await,
        Err(FrameworkError::InvalidSession(0))
    ));
    assert!(matches!(
        engine.push_message(to_session(5, "x")).await,
        Err(FrameworkError::InvalidSession(5))
    ));
    assert!(matches!(
        engine.push_message(to_session(2, "x")).await,
        Err(FrameworkError::SessionNotAllocated(2))
    ));

    engine.invoke_task(labelled(REQUEST_WAIT, "only")).await.unwrap();
    let session = sessions.recv().await.unwrap();
    engine.push_message(to_session(session, "bye")).await.unwrap();
    received.recv().await.unwrap();
    wait_until(|| engine.stats().completed.get() == 1).await;

    assert!(matches!(
        engine.push_message(to_session(session, "late")).await,
        Err(FrameworkError::SessionNotAllocated(s)) if s == session
    ));
    assert!(received.try_recv().is_err());
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_fires_termination_signals() {
    init_tracing();
    let (engine, mut sessions, mut received) = waiting_engine(4);
    engine.start().unwrap();
    engine.invoke_task(labelled(REQUEST_WAIT, "long")).await.unwrap();
    let session = sessions.recv().await.unwrap();

    engine.stop().await.unwrap();
    assert_eq!(engine.stats().terminated.get(), 1);
    let (terminated, label) = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("executor not terminated")
        .unwrap();
    assert_eq!(terminated, session);
    assert_eq!(label, "terminated");
    assert!(!engine.is_running());
}

#[tokio::test]
async fn failures_release_their_sessions() {
    init_tracing();
    let engine = TransactionEngine::new(EngineConfig::new().session_count(2));
    engine
        .register_executor(REQUEST_FAIL, Arc::new(FailingExecutor))
        .unwrap();
    engine.start().unwrap();

    for _ in 0..4 {
        engine.invoke_task(Message::new(REQUEST_FAIL)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_until(|| engine.stats().completed.get() == 4).await;
    assert_eq!(engine.stats().failed.get(), 4);
    assert_eq!(engine.stats().dropped.get(), 0);
    engine.stop().await.unwrap();
}
