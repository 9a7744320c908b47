//! Single-owner registry actor. The roster lives inside one task; every read
//! and write goes through `RegistryHandle`.

use chrono::Utc;
use meshcell_core::config::CoordinationConfig;
use meshcell_core::{Agent, Announce, DirectoryFilter, Error, Heartbeat, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::roster::{Roster, SweepReport, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub staleness_threshold: Duration,
    pub sweep_interval: Duration,
    pub evict_after: Option<Duration>,
}

impl RegistrySettings {
    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self {
            staleness_threshold: config.staleness_threshold(),
            sweep_interval: config.sweep_interval(),
            evict_after: config.evict_after(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&CoordinationConfig::default())
    }
}

enum Command {
    Announce(Announce),
    Heartbeat(Heartbeat),
    List {
        filter: DirectoryFilter,
        reply: oneshot::Sender<Vec<Agent>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<Agent>>,
    },
    CountCapability {
        capability: String,
        reply: oneshot::Sender<usize>,
    },
    Sweep {
        reply: oneshot::Sender<SweepReport>,
    },
}

#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RegistryHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Closed("registry stopped".to_string()))
    }

    async fn ask<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(command)?;
        rx.await
            .map_err(|_| Error::Closed("registry stopped".to_string()))
    }

    pub fn announce(&self, announce: Announce) -> Result<()> {
        self.send(Command::Announce(announce))
    }

    pub fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.send(Command::Heartbeat(heartbeat))
    }

    pub async fn list(&self, filter: DirectoryFilter) -> Result<Vec<Agent>> {
        let (reply, rx) = oneshot::channel();
        self.ask(Command::List { filter, reply }, rx).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::Get {
                id: id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn online_with_capability(&self, capability: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Command::CountCapability {
                capability: capability.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Sweep now, outside the periodic schedule.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let (reply, rx) = oneshot::channel();
        self.ask(Command::Sweep { reply }, rx).await
    }
}

/// Start the registry actor. It stops once every handle is dropped.
pub fn spawn_registry(settings: RegistrySettings) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let roster = Roster::new(settings.staleness_threshold, settings.evict_after);
    let task = tokio::spawn(run_actor(roster, rx, settings.sweep_interval));
    (RegistryHandle { tx }, task)
}

async fn run_actor(mut roster: Roster, mut rx: mpsc::UnboundedReceiver<Command>, sweep_interval: Duration) {
    let sweep_interval = sweep_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(sweep_interval_ms = sweep_interval.as_millis() as u64, "Registry started");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => apply(&mut roster, command),
                None => break,
            },
            _ = ticker.tick() => log_sweep(&roster.sweep(Utc::now())),
        }
    }
    info!(agents = roster.len(), "Registry stopped");
}

fn apply(roster: &mut Roster, command: Command) {
    match command {
        Command::Announce(announce) => {
            let outcome = roster.announce(&announce, Utc::now());
            log_upsert(&announce.id, "announce", outcome);
        }
        Command::Heartbeat(heartbeat) => {
            let outcome = roster.heartbeat(&heartbeat, Utc::now());
            log_upsert(&heartbeat.agent_id, "heartbeat", outcome);
        }
        Command::List { filter, reply } => {
            let _ = reply.send(roster.list(filter));
        }
        Command::Get { id, reply } => {
            let _ = reply.send(roster.get(&id));
        }
        Command::CountCapability { capability, reply } => {
            let _ = reply.send(roster.online_with_capability(&capability));
        }
        Command::Sweep { reply } => {
            let report = roster.sweep(Utc::now());
            log_sweep(&report);
            let _ = reply.send(report);
        }
    }
}

fn log_upsert(id: &str, via: &str, outcome: UpsertOutcome) {
    match outcome {
        UpsertOutcome::Registered => info!(agent_id = %id, via, "Agent registered"),
        UpsertOutcome::Revived => info!(agent_id = %id, via, "Agent back online"),
        UpsertOutcome::Refreshed => debug!(agent_id = %id, via, "Agent refreshed"),
    }
}

fn log_sweep(report: &SweepReport) {
    for id in &report.marked_offline {
        info!(agent_id = %id, "Agent marked offline");
    }
    for id in &report.evicted {
        info!(agent_id = %id, "Agent evicted");
    }
}
