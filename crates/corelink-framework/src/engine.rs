//! Transaction engine: one session per in-flight request.
//!
//! Each invoked request gets a session id from a fixed pool and runs in
//! its own task with a private inbound queue. Follow-up messages find
//! their task through `to_session`. A single core loop owns the slot
//! table, so allocation, routing and release never race.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use corelink_metrics::{Counter, Gauge};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ids::{MessageId, SessionId};
use crate::{FrameworkError, Message};

/// Work bound to one message id.
///
/// `inbound` yields messages pushed to this session; `terminate` fires
/// when the engine stops. Errors are logged by the engine and the
/// session is released either way.
#[async_trait::async_trait]
pub trait TransactionExecutor: Send + Sync + 'static {
    /// Run one transaction in `session`, starting from `request`.
    async fn execute(
        &self,
        session: SessionId,
        request: Message,
        inbound: mpsc::Receiver<Message>,
        terminate: oneshot::Receiver<()>,
    ) -> anyhow::Result<()>;
}

// ── Configuration ─────────────────────────────────────────────────────

/// Sizing for a [`TransactionEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the session pool; ids run from 1 to this value.
    pub session_count: u32,
    /// Capacity of the invocation queue.
    pub queue_capacity: usize,
    /// Capacity of each session's inbound queue.
    pub session_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_count: 1 << 10,
            queue_capacity: 1 << 10,
            session_queue_capacity: 10,
        }
    }
}

impl EngineConfig {
    /// Default sizing: 1024 sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool size, at least one.
    pub fn session_count(mut self, count: u32) -> Self {
        self.session_count = count.max(1);
        self
    }
}

#[derive(Debug, Default, Serialize)]
pub struct EngineStats {
    /// Requests queued through `invoke_task`.
    pub invoked: Counter,
    /// Invocations dropped because no session was free.
    pub dropped: Counter,
    /// Executors that returned `Ok`.
    pub completed: Counter,
    /// Executors that returned an error or panicked.
    pub failed: Counter,
    /// Sessions in use right now.
    pub allocated: Gauge,
    /// Live sessions whose termination signal fired on stop.
    pub terminated: Counter,
}

// ── Engine ────────────────────────────────────────────────────────────

enum Command {
    /// Resolve a session to its inbound queue.
    Route {
        session: SessionId,
        reply: oneshot::Sender<Result<mpsc::Sender<Message>, FrameworkError>>,
    },
}

struct Core {
    invoke: mpsc::Sender<Message>,
    commands: mpsc::Sender<Command>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type Executors = HashMap<MessageId, Arc<dyn TransactionExecutor>>;

/// Runs each request in its own numbered session, with follow-up
/// messages routed to the session by id.
pub struct TransactionEngine {
    config: EngineConfig,
    executors: Mutex<Executors>,
    core: Mutex<Option<Core>>,
    stats: Arc<EngineStats>,
}

impl TransactionEngine {
    /// A stopped engine with no executors.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            executors: Mutex::new(HashMap::new()),
            core: Mutex::new(None),
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Live counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Whether the core loop is up.
    pub fn is_running(&self) -> bool {
        self.core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Bind `executor` to requests with `id`. Only before `start()`.
    pub fn register_executor(
        &self,
        id: MessageId,
        executor: Arc<dyn TransactionExecutor>,
    ) -> Result<(), FrameworkError> {
        if self.is_running() {
            return Err(FrameworkError::EngineRunning);
        }
        let mut executors = self
            .executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if executors.contains_key(&id) {
            return Err(FrameworkError::DuplicateExecutor(id));
        }
        executors.insert(id, executor);
        Ok(())
    }

    /// Spawn the core loop. Fails if already running.
    pub fn start(&self) -> Result<(), FrameworkError> {
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        if core.is_some() {
            return Err(FrameworkError::EngineRunning);
        }
        let executors = Arc::new(
            self.executors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );
        let (invoke_tx, invoke_rx) = mpsc::channel(self.config.queue_capacity);
        let (command_tx, command_rx) = mpsc::channel(self.config.queue_capacity);
        let (complete_tx, complete_rx) = mpsc::channel(self.config.queue_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        let slots = SlotTable::new(self.config.session_count);
        let task = tokio::spawn(core_loop(CoreLoop {
            slots,
            executors,
            session_queue: self.config.session_queue_capacity,
            complete_tx,
            stats: self.stats.clone(),
            invoke_rx,
            command_rx,
            complete_rx,
            stop_rx,
        }));
        *core = Some(Core {
            invoke: invoke_tx,
            commands: command_tx,
            stop: stop_tx,
            task,
        });
        tracing::info!(
            "engine: started with {} sessions",
            self.config.session_count
        );
        Ok(())
    }

    /// Stop the core loop and fire every live session's termination
    /// signal. Running tasks are left to finish on their own.
    pub async fn stop(&self) -> Result<(), FrameworkError> {
        let core = self
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(FrameworkError::EngineStopped)?;
        let _ = core.stop.send(());
        if let Err(e) = core.task.await {
            tracing::warn!("engine: core loop ended abnormally: {e}");
        }
        tracing::info!("engine: stopped");
        Ok(())
    }

    /// Queue `msg` to run in a fresh session.
    pub async fn invoke_task(&self, msg: Message) -> Result<(), FrameworkError> {
        let id = msg.id();
        let bound = self
            .executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id);
        if !bound {
            return Err(FrameworkError::NoExecutor(id));
        }
        if msg.to_session() != 0 {
            return Err(FrameworkError::SessionPreset(msg.to_session()));
        }
        let invoke = self.sender(|core| core.invoke.clone())?;
        invoke
            .send(msg)
            .await
            .map_err(|_| FrameworkError::EngineStopped)
    }

    /// Deliver `msg` to the session named by its `to_session`.
    pub async fn push_message(&self, msg: Message) -> Result<(), FrameworkError> {
        let session = msg.to_session();
        if session == 0 || session > self.config.session_count {
            return Err(FrameworkError::InvalidSession(session));
        }
        let commands = self.sender(|core| core.commands.clone())?;
        let (reply, route) = oneshot::channel();
        commands
            .send(Command::Route { session, reply })
            .await
            .map_err(|_| FrameworkError::EngineStopped)?;
        let inbound = route.await.map_err(|_| FrameworkError::EngineStopped)??;
        inbound
            .send(msg)
            .await
            .map_err(|_| FrameworkError::SessionNotAllocated(session))
    }

    fn sender<T>(&self, pick: impl FnOnce(&Core) -> T) -> Result<T, FrameworkError> {
        self.core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(pick)
            .ok_or(FrameworkError::EngineStopped)
    }
}

impl Default for TransactionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

// ── Slot table ────────────────────────────────────────────────────────

struct Slot {
    inbound: mpsc::Sender<Message>,
    terminate: oneshot::Sender<()>,
}

/// Fixed pool of sessions, allocated round-robin.
struct SlotTable {
    slots: Vec<Option<Slot>>,
    last: u32,
}

impl SlotTable {
    fn new(count: u32) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
            last: count,
        }
    }

    fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// First free id after the last allocated one, wrapping around.
    fn next_free(&self) -> Option<SessionId> {
        let count = self.count();
        (0..count)
            .map(|offset| (self.last + offset) % count + 1)
            .find(|id| self.slots[(*id - 1) as usize].is_none())
    }

    fn occupy(&mut self, id: SessionId, slot: Slot) {
        self.slots[(id - 1) as usize] = Some(slot);
        self.last = id;
    }

    fn get(&self, id: SessionId) -> Option<&Slot> {
        self.slots
            .get((id as usize).wrapping_sub(1))
            .and_then(Option::as_ref)
    }

    fn release(&mut self, id: SessionId) -> Option<Slot> {
        self.slots
            .get_mut((id as usize).wrapping_sub(1))
            .and_then(Option::take)
    }

    fn drain(&mut self) -> impl Iterator<Item = (SessionId, Slot)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|s| (index as u32 + 1, s)))
    }
}

// ── Core loop ─────────────────────────────────────────────────────────

struct CoreLoop {
    slots: SlotTable,
    executors: Arc<Executors>,
    session_queue: usize,
    complete_tx: mpsc::Sender<SessionId>,
    stats: Arc<EngineStats>,
    invoke_rx: mpsc::Receiver<Message>,
    command_rx: mpsc::Receiver<Command>,
    complete_rx: mpsc::Receiver<SessionId>,
    stop_rx: oneshot::Receiver<()>,
}

async fn core_loop(mut core: CoreLoop) {
    loop {
        tokio::select! {
            biased;
            _ = &mut core.stop_rx => break,
            Some(session) = core.complete_rx.recv() => core.release(session),
            Some(command) = core.command_rx.recv() => core.handle(command),
            Some(msg) = core.invoke_rx.recv() => core.allocate(msg),
        }
    }

    let mut terminated = 0;
    for (_, slot) in core.slots.drain() {
        let _ = slot.terminate.send(());
        core.stats.allocated.dec();
        terminated += 1;
    }
    core.stats.terminated.inc_by(terminated);
    tracing::debug!("engine: core loop exited, {terminated} sessions terminated");
}

impl CoreLoop {
    fn allocate(&mut self, msg: Message) {
        let id = msg.id();
        let Some(executor) = self.executors.get(&id).cloned() else {
            tracing::warn!("engine: no executor for {id}, request dropped");
            self.stats.dropped.inc();
            return;
        };
        let Some(session) = self.slots.next_free() else {
            tracing::warn!("engine: no free session for {id}, request dropped");
            self.stats.dropped.inc();
            return;
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(self.session_queue);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        self.slots.occupy(
            session,
            Slot {
                inbound: inbound_tx,
                terminate: terminate_tx,
            },
        );
        self.stats.invoked.inc();
        self.stats.allocated.inc();
        tracing::debug!("engine: {id} allocated session {session}");

        tokio::spawn(run_task(
            executor,
            session,
            msg,
            inbound_rx,
            terminate_rx,
            self.complete_tx.clone(),
            self.stats.clone(),
        ));
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Route { session, reply } => {
                let route = match self.slots.get(session) {
                    Some(slot) => Ok(slot.inbound.clone()),
                    None if session == 0 || session > self.slots.count() => {
                        Err(FrameworkError::InvalidSession(session))
                    }
                    None => {
                        tracing::warn!("engine: push to free session {session} dropped");
                        Err(FrameworkError::SessionNotAllocated(session))
                    }
                };
                let _ = reply.send(route);
            }
        }
    }

    fn release(&mut self, session: SessionId) {
        match self.slots.release(session) {
            Some(_) => {
                self.stats.completed.inc();
                self.stats.allocated.dec();
                tracing::debug!("engine: session {session} released");
            }
            None => tracing::warn!("engine: release of free session {session}"),
        }
    }
}

async fn run_task(
    executor: Arc<dyn TransactionExecutor>,
    session: SessionId,
    request: Message,
    inbound: mpsc::Receiver<Message>,
    terminate: oneshot::Receiver<()>,
    complete: mpsc::Sender<SessionId>,
    stats: Arc<EngineStats>,
) {
    let id = request.id();
    let task =
        tokio::spawn(async move { executor.execute(session, request, inbound, terminate).await });
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.failed.inc();
            tracing::warn!("engine: {id} in session {session} failed: {e:#}");
        }
        Err(e) => {
            stats.failed.inc();
            tracing::warn!("engine: {id} in session {session} aborted: {e}");
        }
    }
    if complete.send(session).await.is_err() {
        tracing::debug!("engine: session {session} finished after stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        let (inbound, _) = mpsc::channel(1);
        let (terminate, _) = oneshot::channel();
        Slot { inbound, terminate }
    }

    #[test]
    fn allocation_is_round_robin() {
        let mut table = SlotTable::new(3);
        assert_eq!(table.next_free(), Some(1));
        table.occupy(1, slot());
        assert_eq!(table.next_free(), Some(2));
        table.occupy(2, slot());
        table.release(1);
        // Continues after the last allocated id before wrapping.
        assert_eq!(table.next_free(), Some(3));
        table.occupy(3, slot());
        assert_eq!(table.next_free(), Some(1));
        table.occupy(1, slot());
        assert_eq!(table.next_free(), None);
    }

    #[test]
    fn out_of_range_ids_are_free_lookups() {
        let mut table = SlotTable::new(2);
        assert!(table.get(0).is_none());
        assert!(table.get(3).is_none());
        assert!(table.release(0).is_none());
        assert!(table.release(9).is_none());
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = SlotTable::new(4);
        table.occupy(2, slot());
        table.occupy(4, slot());
        let ids: Vec<_> = table.drain().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(table.next_free(), Some(1));
    }
}
