use chrono::{DateTime, Utc};
use meshcell_core::{Agent, AgentStatus, Announce, DirectoryFilter, Heartbeat};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// What an announce or heartbeat did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Registered,
    Refreshed,
    /// An offline agent came back.
    Revived,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_offline: Vec<String>,
    pub evicted: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_offline.is_empty() && self.evicted.is_empty()
    }
}

/// The agent roster. Keyed by agent id; `lastSeenAt` is the directory's own clock.
#[derive(Debug, Clone)]
pub struct Roster {
    agents: HashMap<String, Agent>,
    staleness: Duration,
    evict_after: Option<Duration>,
}

impl Roster {
    pub fn new(staleness: Duration, evict_after: Option<Duration>) -> Self {
        Self {
            agents: HashMap::new(),
            staleness,
            evict_after,
        }
    }

    pub fn announce(&mut self, announce: &Announce, now: DateTime<Utc>) -> UpsertOutcome {
        let outcome = self.touch(&announce.id, now);
        if let Some(agent) = self.agents.get_mut(&announce.id) {
            if let Some(name) = announce.display_name.as_deref().filter(|n| !n.is_empty()) {
                agent.display_name = name.to_string();
            }
            agent.capabilities = announce.capabilities.iter().cloned().collect();
            agent.task_types = announce.task_types.iter().cloned().collect();
        }
        outcome
    }

    pub fn heartbeat(&mut self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> UpsertOutcome {
        let outcome = self.touch(&heartbeat.agent_id, now);
        if let Some(agent) = self.agents.get_mut(&heartbeat.agent_id) {
            agent.last_heartbeat = Some(heartbeat.status);
            agent.uptime_ms = heartbeat.uptime_ms;
            agent.tasks_processed = heartbeat.tasks_processed;
        }
        outcome
    }

    /// Upsert the record, refresh `lastSeenAt` and flip it online.
    fn touch(&mut self, id: &str, now: DateTime<Utc>) -> UpsertOutcome {
        match self.agents.get_mut(id) {
            Some(agent) => {
                let outcome = match agent.status {
                    AgentStatus::Offline => UpsertOutcome::Revived,
                    AgentStatus::Online => UpsertOutcome::Refreshed,
                };
                agent.status = AgentStatus::Online;
                agent.last_seen_at = now;
                outcome
            }
            None => {
                self.agents.insert(
                    id.to_string(),
                    Agent {
                        id: id.to_string(),
                        display_name: id.to_string(),
                        capabilities: BTreeSet::new(),
                        task_types: BTreeSet::new(),
                        status: AgentStatus::Online,
                        last_seen_at: now,
                        registered_at: now,
                        last_heartbeat: None,
                        uptime_ms: 0,
                        tasks_processed: 0,
                    },
                );
                UpsertOutcome::Registered
            }
        }
    }

    /// Mark agents unseen for longer than the staleness threshold offline, then
    /// drop offline agents older than `evict_after` when it is set.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for agent in self.agents.values_mut() {
            if agent.status == AgentStatus::Online && age(agent, now) > self.staleness {
                agent.status = AgentStatus::Offline;
                report.marked_offline.push(agent.id.clone());
            }
        }
        if let Some(limit) = self.evict_after {
            self.agents.retain(|id, agent| {
                let keep = agent.status == AgentStatus::Online || age(agent, now) <= limit;
                if !keep {
                    report.evicted.push(id.clone());
                }
                keep
            });
        }
        report.marked_offline.sort();
        report.evicted.sort();
        report
    }

    pub fn list(&self, filter: DirectoryFilter) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .values()
            .filter(|a| filter.accepts(a.status))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).cloned()
    }

    /// Online agents advertising `capability`.
    pub fn online_with_capability(&self, capability: &str) -> usize {
        self.agents
            .values()
            .filter(|a| a.status == AgentStatus::Online && a.capabilities.contains(capability))
            .count()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn age(agent: &Agent, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(agent.last_seen_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use meshcell_core::HeartbeatStatus;

    fn announce(id: &str, caps: &[&str]) -> Announce {
        Announce {
            id: id.to_string(),
            display_name: None,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            task_types: vec!["echo".to_string()],
            timestamp: Utc::now(),
        }
    }

    fn heartbeat(id: &str, processed: u64) -> Heartbeat {
        Heartbeat {
            agent_id: id.to_string(),
            status: HeartbeatStatus::Alive,
            uptime_ms: 1000,
            tasks_processed: processed,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_reannounce_is_idempotent() {
        let mut roster = Roster::new(Duration::from_secs(90), None);
        let t0 = Utc::now();
        assert_eq!(roster.announce(&announce("a1", &["summarize"]), t0), UpsertOutcome::Registered);
        let t1 = t0 + ChronoDuration::seconds(5);
        assert_eq!(roster.announce(&announce("a1", &["translate"]), t1), UpsertOutcome::Refreshed);

        assert_eq!(roster.list(DirectoryFilter::All).len(), 1);
        let agent = roster.get("a1").unwrap();
        assert_eq!(agent.registered_at, t0);
        assert_eq!(agent.last_seen_at, t1);
        assert!(agent.capabilities.contains("translate"));
        assert!(!agent.capabilities.contains("summarize"));
    }

    #[test]
    fn test_sweep_marks_stale_offline_and_heartbeat_revives() {
        let mut roster = Roster::new(Duration::from_secs(90), None);
        let t0 = Utc::now();
        roster.announce(&announce("a1", &[]), t0);
        roster.announce(&announce("a2", &[]), t0 + ChronoDuration::seconds(60));

        // One missed heartbeat is not enough.
        assert!(roster.sweep(t0 + ChronoDuration::seconds(60)).is_empty());

        let report = roster.sweep(t0 + ChronoDuration::seconds(91));
        assert_eq!(report.marked_offline, vec!["a1".to_string()]);
        assert_eq!(roster.list(DirectoryFilter::Offline).len(), 1);
        assert_eq!(roster.list(DirectoryFilter::Online)[0].id, "a2");

        let outcome = roster.heartbeat(&heartbeat("a1", 7), t0 + ChronoDuration::seconds(95));
        assert_eq!(outcome, UpsertOutcome::Revived);
        let agent = roster.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.tasks_processed, 7);
        assert_eq!(agent.last_heartbeat, Some(HeartbeatStatus::Alive));
    }

    #[test]
    fn test_heartbeat_from_unknown_agent_registers_it() {
        let mut roster = Roster::new(Duration::from_secs(90), None);
        assert_eq!(roster.heartbeat(&heartbeat("late", 0), Utc::now()), UpsertOutcome::Registered);
        assert_eq!(roster.get("late").unwrap().display_name, "late");
    }

    #[test]
    fn test_agents_kept_forever_without_eviction() {
        let mut roster = Roster::new(Duration::from_secs(1), None);
        let t0 = Utc::now();
        roster.announce(&announce("a1", &[]), t0);
        roster.sweep(t0 + ChronoDuration::days(30));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_eviction_when_configured() {
        let mut roster = Roster::new(Duration::from_secs(1), Some(Duration::from_secs(60)));
        let t0 = Utc::now();
        roster.announce(&announce("a1", &[]), t0);
        roster.announce(&announce("a2", &[]), t0 + ChronoDuration::seconds(100));

        let report = roster.sweep(t0 + ChronoDuration::seconds(30));
        assert_eq!(report.marked_offline, vec!["a1".to_string()]);
        assert!(report.evicted.is_empty());

        let report = roster.sweep(t0 + ChronoDuration::seconds(61));
        assert_eq!(report.evicted, vec!["a1".to_string()]);
        assert!(roster.get("a1").is_none());
        assert!(roster.get("a2").is_some());
    }

    #[test]
    fn test_online_with_capability() {
        let mut roster = Roster::new(Duration::from_secs(90), None);
        let t0 = Utc::now();
        roster.announce(&announce("a1", &["summarize"]), t0);
        roster.announce(&announce("a2", &["summarize"]), t0 + ChronoDuration::seconds(200));
        roster.sweep(t0 + ChronoDuration::seconds(200));
        assert_eq!(roster.online_with_capability("summarize"), 1);
        assert_eq!(roster.online_with_capability("translate"), 0);
    }
}
