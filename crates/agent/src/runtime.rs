use chrono::Utc;
use futures::FutureExt;
use meshcell_bus::{Bus, BusConnector, BusMessage, Subscription};
use meshcell_core::{
    topics, AgentEvent, Announce, BroadcastMessage, CapabilityRequest, CapabilityResponse, Config,
    Error, HeartbeatStatus, MessageEnvelope, Result, Task, TaskResult,
};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builtin;
use crate::handler::{CapabilityHandler, CapabilityRegistry, HandlerRegistry, TaskContext, TaskHandler};
use crate::heartbeat::HeartbeatService;
use crate::state::{AgentState, ExitReason};
use crate::stats::{AgentStatusReport, StatsHandle, TaskStats};

const INBOX_CAPACITY: usize = 64;
const ABORTED_AT_SHUTDOWN: &str = "aborted during shutdown";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_id: String,
    pub display_name: String,
    /// Descriptive capability names to advertise.
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub drain_timeout: Duration,
}

impl AgentSettings {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            display_name: agent_id.to_string(),
            capabilities: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_tasks: 1,
            drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let agent_id = config.agent.resolve_id();
        let display_name = config
            .agent
            .display_name
            .clone()
            .unwrap_or_else(|| agent_id.clone());
        Self {
            agent_id,
            display_name,
            capabilities: config.agent.capabilities.clone(),
            heartbeat_interval: config.coordination.heartbeat_interval(),
            max_concurrent_tasks: config.agent.max_concurrent_tasks.max(1),
            drain_timeout: Duration::from_millis(config.agent.drain_timeout_ms),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The id becomes a topic token (`agent.<id>.status`), so it must be one.
    pub fn validate(&self) -> Result<()> {
        if !topics::is_valid_token(&self.agent_id) {
            return Err(Error::Validation(format!(
                "agent id '{}' must be a single topic token (no '.', '*', '>' or whitespace)",
                self.agent_id
            )));
        }
        Ok(())
    }
}

/// One agent process: announces itself, runs its task, event, broadcast and
/// capability loops, heartbeats, and shuts down in order.
pub struct AgentRuntime {
    settings: AgentSettings,
    handlers: HandlerRegistry,
    capabilities: CapabilityRegistry,
    stats: StatsHandle,
    state_tx: watch::Sender<AgentState>,
    inbox_tx: broadcast::Sender<MessageEnvelope>,
}

impl AgentRuntime {
    pub fn new(settings: AgentSettings) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Starting);
        let (inbox_tx, _) = broadcast::channel(INBOX_CAPACITY);
        Self {
            settings,
            handlers: HandlerRegistry::new(),
            capabilities: CapabilityRegistry::new(),
            stats: StatsHandle::default(),
            state_tx,
            inbox_tx,
        }
    }

    /// Build from config, enabling the built-in handlers it names.
    pub fn from_config(config: &Config) -> Self {
        let mut runtime = Self::new(AgentSettings::from_config(config));
        for name in &config.agent.task_types {
            match builtin::task_handler(name) {
                Some(handler) => runtime.register_handler(handler),
                None => warn!(task_type = %name, "No built-in handler for task type, skipping"),
            }
        }
        for name in &config.agent.capabilities {
            if let Some(handler) = builtin::capability_handler(name) {
                runtime.register_capability(handler);
            }
        }
        runtime
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register_handler(handler);
        self
    }

    pub fn with_capability(mut self, handler: Arc<dyn CapabilityHandler>) -> Self {
        self.register_capability(handler);
        self
    }

    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(handler);
    }

    pub fn register_capability(&mut self, handler: Arc<dyn CapabilityHandler>) {
        self.capabilities.register(handler);
    }

    pub fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats.snapshot()
    }

    /// Direct messages (`message` events and broadcasts) received while running.
    pub fn inbox(&self) -> broadcast::Receiver<MessageEnvelope> {
        self.inbox_tx.subscribe()
    }

    /// Configured capability names plus every capability served by a handler.
    pub fn advertised_capabilities(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.settings.capabilities.iter().cloned().collect();
        names.extend(self.capabilities.names());
        names.into_iter().collect()
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(agent_id = %self.settings.agent_id, from = %previous, to = %state, "Agent state");
        }
    }

    /// Run until a shutdown/restart request, `shutdown` resolving, or the bus
    /// going away. Losing the bus is an error: an agent cannot work disconnected.
    pub async fn run<F>(&self, connector: &dyn BusConnector, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = ()> + Send,
    {
        self.set_state(AgentState::Starting);
        let started = Instant::now();
        if let Err(e) = self.settings.validate() {
            error!(error = %e, "Invalid agent settings");
            self.set_state(AgentState::Terminated);
            return Err(e);
        }

        self.set_state(AgentState::Connecting);
        let bus = match connector.connect().await {
            Ok(bus) => bus,
            Err(e) => {
                error!(agent_id = %self.settings.agent_id, error = %e, "Could not connect to bus");
                self.set_state(AgentState::Terminated);
                return Err(e);
            }
        };

        let outcome = self.run_connected(bus, started, shutdown).await;
        self.set_state(AgentState::Terminated);
        outcome
    }

    async fn run_connected<F>(&self, bus: Arc<dyn Bus>, started: Instant, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            agent_id: self.settings.agent_id.clone(),
            display_name: self.settings.display_name.clone(),
            advertised: self.advertised_capabilities(),
            bus: bus.clone(),
            handlers: self.handlers.clone(),
            capabilities: self.capabilities.clone(),
            stats: self.stats.clone(),
            inbox: self.inbox_tx.clone(),
            state: self.state_tx.subscribe(),
            permits: Arc::new(Semaphore::new(self.settings.max_concurrent_tasks.max(1))),
            drain_timeout: self.settings.drain_timeout,
            started,
            stop: stop_tx,
            accepted: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(1),
        });

        worker.announce().await?;
        self.set_state(AgentState::Announced);

        let tasks = bus.subscribe(topics::TASKS_PATTERN).await?;
        let events = bus.subscribe(&topics::events(&worker.agent_id)).await?;
        let broadcasts = bus.subscribe(topics::BROADCAST).await?;
        let dispatch = if self.capabilities.is_empty() {
            None
        } else {
            Some(bus.subscribe(topics::CAPABILITY_DISPATCH).await?)
        };

        let loops_cancel = CancellationToken::new();
        let mut loops: Vec<JoinHandle<()>> = vec![
            tokio::spawn(task_loop(worker.clone(), tasks, loops_cancel.clone())),
            tokio::spawn(event_loop(worker.clone(), events, loops_cancel.clone())),
            tokio::spawn(broadcast_loop(worker.clone(), broadcasts, loops_cancel.clone())),
        ];
        if let Some(dispatch) = dispatch {
            loops.push(tokio::spawn(capability_loop(
                worker.clone(),
                dispatch,
                loops_cancel.clone(),
            )));
        }

        let heartbeat = Arc::new(HeartbeatService::new(
            &worker.agent_id,
            self.settings.heartbeat_interval,
            started,
            self.stats.clone(),
            bus.clone(),
        ));
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_task = tokio::spawn(heartbeat.clone().run_loop(heartbeat_cancel.clone()));

        self.set_state(AgentState::Running);
        info!(
            agent_id = %worker.agent_id,
            task_types = ?worker.handlers.task_types(),
            capabilities = ?worker.advertised,
            "Agent running"
        );

        let reason = tokio::select! {
            _ = shutdown => {
                info!(agent_id = %worker.agent_id, "Termination signal received");
                ExitReason::Shutdown
            }
            reason = stop_rx.recv() => reason.unwrap_or(ExitReason::BusLost),
        };

        self.set_state(AgentState::Stopping);
        info!(agent_id = %worker.agent_id, reason = %reason, "Agent stopping");

        // The timer goes first so no `alive` beat can land after the final one.
        heartbeat_cancel.cancel();
        let _ = heartbeat_task.await;

        if reason != ExitReason::BusLost {
            let status = match reason {
                ExitReason::Restart => HeartbeatStatus::Restarting,
                _ => HeartbeatStatus::Stopping,
            };
            if let Err(e) = heartbeat.beat(status).await {
                warn!(agent_id = %worker.agent_id, error = %e, "Final heartbeat failed");
            }
        }

        loops_cancel.cancel();
        for handle in loops {
            let _ = handle.await;
        }

        match reason {
            ExitReason::BusLost => {
                error!(agent_id = %worker.agent_id, "Bus connection lost");
                Err(Error::Connection(format!(
                    "agent {} lost its bus connection",
                    worker.agent_id
                )))
            }
            reason => {
                if let Err(e) = bus.flush().await {
                    warn!(agent_id = %worker.agent_id, error = %e, "Bus flush failed");
                }
                info!(agent_id = %worker.agent_id, "Agent terminated");
                Ok(reason)
            }
        }
    }
}

/// Per-run state shared by the loops.
struct Worker {
    agent_id: String,
    display_name: String,
    advertised: Vec<String>,
    bus: Arc<dyn Bus>,
    handlers: HandlerRegistry,
    capabilities: CapabilityRegistry,
    stats: StatsHandle,
    inbox: broadcast::Sender<MessageEnvelope>,
    state: watch::Receiver<AgentState>,
    permits: Arc<Semaphore>,
    drain_timeout: Duration,
    started: Instant,
    stop: mpsc::UnboundedSender<ExitReason>,
    /// Tasks taken on but without a published result yet, by slot.
    accepted: Mutex<HashMap<u64, (String, Instant)>>,
    next_slot: AtomicU64,
}

impl Worker {
    fn context(&self) -> TaskContext {
        TaskContext {
            agent_id: self.agent_id.clone(),
            bus: self.bus.clone(),
        }
    }

    fn stop(&self, reason: ExitReason) {
        let _ = self.stop.send(reason);
    }

    fn accepted(&self) -> MutexGuard<'_, HashMap<u64, (String, Instant)>> {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(&self, task_id: &str) -> u64 {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.accepted().insert(slot, (task_id.to_string(), Instant::now()));
        slot
    }

    /// Claim the right to publish the slot's result. False once the
    /// shutdown path has answered for it.
    fn settle(&self, slot: u64) -> bool {
        self.accepted().remove(&slot).is_some()
    }

    /// Publish a failed result for every accepted task that never finished.
    async fn fail_unsettled(&self, reason: &str) {
        let unsettled: Vec<(String, Instant)> = self.accepted().drain().map(|(_, entry)| entry).collect();
        for (task_id, accepted_at) in unsettled {
            let elapsed_ms = accepted_at.elapsed().as_millis() as u64;
            warn!(agent_id = %self.agent_id, task_id = %task_id, reason, "Task did not finish");
            self.stats.record(false, elapsed_ms);
            self.publish_result(&TaskResult::failed(&self.agent_id, &task_id, reason, elapsed_ms))
                .await;
        }
    }

    async fn announce(&self) -> Result<()> {
        let announce = Announce {
            id: self.agent_id.clone(),
            display_name: Some(self.display_name.clone()),
            capabilities: self.advertised.clone(),
            task_types: self.handlers.task_types(),
            timestamp: Utc::now(),
        };
        self.bus
            .publish(topics::ANNOUNCE, serde_json::to_value(&announce)?)
            .await?;
        debug!(agent_id = %self.agent_id, "Announced");
        Ok(())
    }

    fn report(&self) -> AgentStatusReport {
        AgentStatusReport {
            agent_id: self.agent_id.clone(),
            display_name: self.display_name.clone(),
            state: *self.state.borrow(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            capabilities: self.advertised.clone(),
            task_types: self.handlers.task_types(),
            stats: self.stats.snapshot(),
            timestamp: Utc::now(),
        }
    }

    fn deliver(&self, envelope: MessageEnvelope) {
        info!(
            agent_id = %self.agent_id,
            from = %envelope.from,
            kind = ?envelope.kind,
            "Message received"
        );
        if self.inbox.send(envelope).is_err() {
            debug!(agent_id = %self.agent_id, "No inbox listener for message");
        }
    }

    /// Run one task to exactly one TaskResult and publish it.
    async fn execute(&self, slot: u64, task: Task, handler: Arc<dyn TaskHandler>) {
        let started = Instant::now();
        let ctx = self.context();
        debug!(agent_id = %self.agent_id, task_id = %task.id, task_type = %task.task_type, "Executing task");

        let run = AssertUnwindSafe(handler.handle(&task, &ctx)).catch_unwind();
        let joined = match task.timeout_ms {
            Some(limit) => tokio::time::timeout(Duration::from_millis(limit), run).await.ok(),
            None => Some(run.await),
        };
        let outcome = match joined {
            None => Err(format!(
                "task {} timed out after {}ms",
                task.id,
                task.timeout_ms.unwrap_or_default()
            )),
            Some(Ok(Ok(payload))) => Ok(payload),
            Some(Ok(Err(e))) => Err(e.to_string()),
            Some(Err(panic)) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        if !self.settle(slot) {
            return;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(payload) => TaskResult::completed(&self.agent_id, &task.id, payload, elapsed_ms),
            Err(error) => {
                warn!(agent_id = %self.agent_id, task_id = %task.id, error = %error, "Task failed");
                TaskResult::failed(&self.agent_id, &task.id, &error, elapsed_ms)
            }
        };
        self.stats.record(result.is_success(), elapsed_ms);
        self.publish_result(&result).await;
    }

    async fn publish_result(&self, result: &TaskResult) {
        let payload = match serde_json::to_value(result) {
            Ok(payload) => payload,
            Err(e) => {
                error!(task_id = %result.task_id, error = %e, "Failed to encode task result");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topics::TASK_RESULT, payload).await {
            warn!(agent_id = %self.agent_id, task_id = %result.task_id, error = %e, "Failed to publish task result");
        }
    }

    async fn handle_event(&self, message: &BusMessage, event: AgentEvent) {
        debug!(agent_id = %self.agent_id, event_type = %event.event_type, "Event received");
        match event.event_type.as_str() {
            "shutdown" => self.stop(ExitReason::Shutdown),
            "restart" => self.stop(ExitReason::Restart),
            "status" | "ping" => {
                let report = self.report();
                if message.reply_to.is_none() {
                    info!(agent_id = %self.agent_id, processed = report.stats.processed, "Status requested");
                    return;
                }
                match serde_json::to_value(&report) {
                    Ok(payload) => {
                        if let Err(e) = self.bus.reply(message, payload).await {
                            warn!(agent_id = %self.agent_id, error = %e, "Failed to reply to status event");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode status report"),
                }
            }
            "message" => match serde_json::from_value::<MessageEnvelope>(event.data) {
                Ok(envelope) => self.deliver(envelope),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Malformed message event, dropping"),
            },
            "announce" => {
                if let Err(e) = self.announce().await {
                    warn!(agent_id = %self.agent_id, error = %e, "Re-announce failed");
                }
            }
            other => warn!(agent_id = %self.agent_id, event_type = %other, "Unknown event type, dropping"),
        }
    }

    async fn handle_broadcast(&self, broadcast: BroadcastMessage) {
        match broadcast.message_type.as_str() {
            "shutdown" => {
                info!(agent_id = %self.agent_id, "Shutdown broadcast received");
                self.stop(ExitReason::Shutdown);
            }
            "restart" => self.stop(ExitReason::Restart),
            "announce" => {
                if let Err(e) = self.announce().await {
                    warn!(agent_id = %self.agent_id, error = %e, "Re-announce failed");
                }
            }
            "message" => match serde_json::from_value::<MessageEnvelope>(broadcast.message) {
                Ok(envelope) => self.deliver(envelope),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Malformed broadcast message, dropping"),
            },
            other => info!(
                agent_id = %self.agent_id,
                message_type = %other,
                message = %broadcast.message,
                "Broadcast received"
            ),
        }
    }

    async fn serve_capability(
        &self,
        message: BusMessage,
        request: CapabilityRequest,
        handler: Arc<dyn CapabilityHandler>,
    ) {
        let ctx = self.context();
        let limit = Duration::from_millis(request.timeout_ms.max(1));
        let run = AssertUnwindSafe(handler.invoke(&request.parameters, &ctx)).catch_unwind();
        let response = match tokio::time::timeout(limit, run).await {
            Err(_) => {
                debug!(request_id = %request.request_id, "Capability handler outlived the request, not replying");
                return;
            }
            Ok(Ok(Ok(result))) => CapabilityResponse::ok(&request, &self.agent_id, result),
            Ok(Ok(Err(e))) => CapabilityResponse::error(&request, &self.agent_id, &e.to_string()),
            Ok(Err(panic)) => CapabilityResponse::error(
                &request,
                &self.agent_id,
                &format!("handler panicked: {}", panic_message(panic.as_ref())),
            ),
        };
        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode capability response");
                return;
            }
        };
        if let Err(e) = self.bus.reply(&message, payload).await {
            warn!(request_id = %request.request_id, error = %e, "Failed to reply to capability request");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn task_loop(worker: Arc<Worker>, mut subscription: Subscription, cancel: CancellationToken) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(agent_id = %worker.agent_id, error = %e, "Task execution aborted");
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else {
                    worker.stop(ExitReason::BusLost);
                    break;
                };
                let task = match Task::parse(message.payload) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(agent_id = %worker.agent_id, topic = %message.topic, error = %e, "Dropping invalid task");
                        continue;
                    }
                };
                let Some(handler) = worker.handlers.get(&task.task_type) else {
                    debug!(agent_id = %worker.agent_id, task_type = %task.task_type, "No handler for task type, ignoring");
                    continue;
                };
                let slot = worker.accept(&task.id);
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = worker.permits.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break };
                let runner = worker.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    runner.execute(slot, task, handler).await;
                });
            }
        }
    }
    drop(subscription);

    drain(&worker.agent_id, "tasks", &mut in_flight, worker.drain_timeout).await;
    worker.fail_unsettled(ABORTED_AT_SHUTDOWN).await;
}

/// Wait up to `limit` for spawned work to finish, then abort the rest.
async fn drain(agent_id: &str, what: &str, set: &mut JoinSet<()>, limit: Duration) {
    if set.is_empty() {
        return;
    }
    info!(agent_id = %agent_id, what, count = set.len(), "Draining in-flight work");
    let drained = tokio::time::timeout(limit, async {
        while set.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            agent_id = %agent_id,
            what,
            remaining = set.len(),
            "Drain timeout reached, aborting remaining work"
        );
        set.shutdown().await;
    }
}

async fn event_loop(worker: Arc<Worker>, mut subscription: Subscription, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            worker.stop(ExitReason::BusLost);
            break;
        };
        match AgentEvent::parse(message.payload.clone()) {
            Ok(event) => worker.handle_event(&message, event).await,
            Err(e) => warn!(agent_id = %worker.agent_id, error = %e, "Dropping invalid event"),
        }
    }
}

async fn broadcast_loop(worker: Arc<Worker>, mut subscription: Subscription, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            worker.stop(ExitReason::BusLost);
            break;
        };
        match BroadcastMessage::parse(message.payload) {
            Ok(broadcast) => worker.handle_broadcast(broadcast).await,
            Err(e) => warn!(agent_id = %worker.agent_id, error = %e, "Dropping invalid broadcast"),
        }
    }
}

async fn capability_loop(worker: Arc<Worker>, mut subscription: Subscription, cancel: CancellationToken) {
    let mut responders = JoinSet::new();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = responders.join_next(), if !responders.is_empty() => {
                if let Err(e) = joined {
                    warn!(agent_id = %worker.agent_id, error = %e, "Capability responder aborted");
                }
                continue;
            }
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            worker.stop(ExitReason::BusLost);
            break;
        };
        let request = match CapabilityRequest::parse(message.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(agent_id = %worker.agent_id, error = %e, "Dropping invalid capability request");
                continue;
            }
        };
        let Some(handler) = worker.capabilities.get(&request.capability) else {
            debug!(agent_id = %worker.agent_id, capability = %request.capability, "Capability not served here");
            continue;
        };
        let responder = worker.clone();
        responders.spawn(async move {
            responder.serve_capability(message, request, handler).await;
        });
    }
    drop(subscription);

    drain(&worker.agent_id, "capability responders", &mut responders, worker.drain_timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshcell_bus::MemoryBus;
    use meshcell_core::{Heartbeat, TaskResultStatus};
    use serde_json::{json, Value};

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        fn task_type(&self) -> &str {
            "fail"
        }

        async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> Result<Value> {
            Err(Error::Processing("boom".to_string()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        fn task_type(&self) -> &str {
            "panic"
        }

        async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> Result<Value> {
            panic!("handler exploded");
        }
    }

    struct SlowCapability {
        done: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl CapabilityHandler for SlowCapability {
        fn capability(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, parameters: &Value, _ctx: &TaskContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.done.store(true, Ordering::SeqCst);
            Ok(parameters.clone())
        }
    }

    fn runtime(id: &str) -> AgentRuntime {
        let settings = AgentSettings::new(id)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_drain_timeout(Duration::from_millis(500));
        AgentRuntime::new(settings)
            .with_handler(Arc::new(builtin::EchoHandler))
            .with_handler(Arc::new(builtin::DelayHandler))
            .with_handler(Arc::new(FailingHandler))
            .with_handler(Arc::new(PanickingHandler))
    }

    async fn wait_running(runtime: &AgentRuntime) {
        let mut state = runtime.watch_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == AgentState::Running))
            .await
            .unwrap()
            .unwrap();
    }

    async fn next_result(results: &mut Subscription) -> TaskResult {
        let msg = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        msg.decode().unwrap()
    }

    #[tokio::test]
    async fn test_task_outcomes() {
        let bus = MemoryBus::new();
        let mut results = bus.subscribe(topics::TASK_RESULT).await.unwrap();
        let agent = Arc::new(runtime("a1"));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move {
                agent
                    .run(&connector, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };
        wait_running(&agent).await;

        bus.publish("tasks.echo", json!({"id": "t1", "type": "echo", "data": "hi"})).await.unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "t1");
        assert_eq!(result.agent_id, "a1");
        assert_eq!(result.status, TaskResultStatus::Completed);
        assert_eq!(result.payload, json!("hi"));

        bus.publish("tasks.fail", json!({"id": "t2", "type": "fail", "payload": {}})).await.unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert!(result.error.unwrap().contains("boom"));

        bus.publish("tasks.panic", json!({"id": "t3", "type": "panic", "payload": {}})).await.unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert!(result.error.unwrap().contains("handler exploded"));

        bus.publish(
            "tasks.delay",
            json!({"id": "t4", "type": "delay", "payload": {"ms": 500}, "timeoutMs": 20}),
        )
        .await
        .unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "t4");
        assert!(result.error.unwrap().contains("timed out"));

        let stats = agent.stats();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 3);

        stop_tx.send(()).unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Shutdown);
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_invalid_and_unhandled_tasks_produce_no_result() {
        let bus = MemoryBus::new();
        let mut results = bus.subscribe(topics::TASK_RESULT).await.unwrap();
        let agent = Arc::new(runtime("a1"));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        bus.publish("tasks.echo", json!({"type": "echo", "payload": "no id"})).await.unwrap();
        bus.publish("tasks.echo", json!("garbage")).await.unwrap();
        bus.publish("tasks.translate", json!({"id": "t9", "type": "translate", "payload": 1}))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), results.recv())
            .await
            .is_err());
        assert_eq!(agent.stats().processed, 0);

        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_event_publishes_final_heartbeat() {
        let bus = MemoryBus::new();
        let mut status = bus.subscribe(&topics::status("a1")).await.unwrap();
        let agent = Arc::new(runtime("a1"));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Shutdown);

        let mut last = None;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(20), status.recv()).await {
            last = Some(msg.decode::<Heartbeat>().unwrap());
        }
        assert_eq!(last.unwrap().status, HeartbeatStatus::Stopping);
    }

    #[tokio::test]
    async fn test_restart_broadcast() {
        let bus = MemoryBus::new();
        let mut status = bus.subscribe("agent.*.status").await.unwrap();
        let agent = Arc::new(runtime("a1"));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        bus.publish(topics::BROADCAST, json!({"type": "restart", "message": null})).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Restart);
        let mut last = None;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(20), status.recv()).await {
            last = Some(msg.decode::<Heartbeat>().unwrap());
        }
        assert_eq!(last.unwrap().status, HeartbeatStatus::Restarting);
    }

    #[tokio::test]
    async fn test_status_event_replies_with_report() {
        let bus = MemoryBus::new();
        let agent = Arc::new(runtime("a1"));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        let reply = bus
            .request(&topics::events("a1"), json!({"type": "status"}), Duration::from_secs(1))
            .await
            .unwrap();
        let report: AgentStatusReport = reply.decode().unwrap();
        assert_eq!(report.agent_id, "a1");
        assert_eq!(report.state, AgentState::Running);
        assert!(report.task_types.contains(&"echo".to_string()));

        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_message_event_reaches_inbox() {
        let bus = MemoryBus::new();
        let agent = Arc::new(runtime("a1"));
        let mut inbox = agent.inbox();
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        let envelope = MessageEnvelope::new("cli", "a1", meshcell_core::MessageKind::Text, json!("hello"));
        bus.publish(
            &topics::events("a1"),
            json!({"type": "message", "data": serde_json::to_value(&envelope).unwrap()}),
        )
        .await
        .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.content, json!("hello"));
        assert_eq!(received.from, "cli");

        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capability_dispatch_answered() {
        let bus = MemoryBus::new();
        let agent = Arc::new(runtime("a1").with_capability(Arc::new(builtin::EchoCapability)));
        assert_eq!(agent.advertised_capabilities(), vec!["echo".to_string()]);
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        let request = CapabilityRequest::new("echo", json!({"x": 1}), "test", 1000);
        let reply = bus
            .request(
                topics::CAPABILITY_DISPATCH,
                serde_json::to_value(&request).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: CapabilityResponse = reply.decode().unwrap();
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.result, json!({"x": 1}));
        assert_eq!(response.responder_id.as_deref(), Some("a1"));

        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bus_close_is_fatal() {
        let bus = MemoryBus::new();
        let agent = Arc::new(runtime("a1"));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        bus.close();
        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_error() {
        let bus = MemoryBus::new();
        bus.close();
        let agent = runtime("a1");
        assert!(agent.run(&bus, std::future::pending()).await.is_err());
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_drain_timeout_fails_unfinished_tasks() {
        let bus = MemoryBus::new();
        let mut results = bus.subscribe(topics::TASK_RESULT).await.unwrap();
        let settings = AgentSettings::new("a1")
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_drain_timeout(Duration::from_millis(100));
        let agent = Arc::new(AgentRuntime::new(settings).with_handler(Arc::new(builtin::DelayHandler)));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        bus.publish("tasks.delay", json!({"id": "slow", "type": "delay", "payload": {"ms": 2000}}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Shutdown);

        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "slow");
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert!(result.error.unwrap().contains("aborted during shutdown"));
        assert!(tokio::time::timeout(Duration::from_millis(50), results.recv()).await.is_err());

        let stats = agent.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_capability_reply_lands_before_exit() {
        let bus = MemoryBus::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let agent = Arc::new(runtime("a1").with_capability(Arc::new(SlowCapability { done: done.clone() })));
        let run = {
            let agent = agent.clone();
            let connector = bus.clone();
            tokio::spawn(async move { agent.run(&connector, std::future::pending()).await })
        };
        wait_running(&agent).await;

        let request = CapabilityRequest::new("slow", json!({"n": 7}), "test", 1000);
        let pending = {
            let bus = bus.clone();
            let payload = serde_json::to_value(&request).unwrap();
            tokio::spawn(async move {
                bus.request(topics::CAPABILITY_DISPATCH, payload, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.publish(&topics::events("a1"), json!({"type": "shutdown"})).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), ExitReason::Shutdown);
        assert!(done.load(Ordering::SeqCst));

        let reply = pending.await.unwrap().unwrap();
        let response: CapabilityResponse = reply.decode().unwrap();
        assert_eq!(response.result, json!({"n": 7}));
    }

    #[tokio::test]
    async fn test_dotted_agent_id_rejected() {
        let bus = MemoryBus::new();
        let agent = runtime("team.a1");
        let err = agent.run(&bus, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(agent.state(), AgentState::Terminated);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
