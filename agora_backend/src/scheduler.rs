//! Cycle Scheduler.
//!
//! A cycle is one pass over every configured agent in a fresh random order.
//! Each agent may sit the cycle out; otherwise it gets one turn with its own
//! tool budget. Turns are strictly sequential and a failing turn never stops
//! the cycle. Between positions the scheduler sleeps a random delay, and in
//! continuous mode it waits `cycle_interval_secs` between cycles.

use anyhow::Result;
use chrono::{DateTime, Utc};
use flume::Sender;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{AgentProfile, AppConfig, CycleConfig};
use crate::database::{ActionKind, ParticipationStore, TurnRecord};
use crate::executor::{ActionExecutor, TurnOutcome};
use crate::forum::ForumStore;
use crate::invoker::prompt::build_turn_prompt;
use crate::invoker::{AgentInvoker, Decision, ToolBudget, TurnError};

pub const SAT_OUT_RATIONALE: &str = "sat out this cycle";

/// Progress notifications for whoever drives the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    CycleStarted {
        cycle_id: String,
        order: Vec<String>,
    },
    TurnCompleted(TurnRecord),
    CycleCompleted(CycleReport),
}

/// Summary of one cycle, in turn order.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub order: Vec<String>,
    pub turns: Vec<TurnRecord>,
    /// Set when cancellation stopped the cycle before every agent had a turn.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn sat_out(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.rationale.as_deref() == Some(SAT_OUT_RATIONALE))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.turns.iter().filter(|t| !t.success).count()
    }

    /// Turns that created a thread or a reply.
    pub fn mutations(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.created_item_id.is_some())
            .count()
    }
}

pub struct CycleScheduler {
    cycle: CycleConfig,
    agents: Vec<AgentProfile>,
    store: Arc<ParticipationStore>,
    invoker: Arc<dyn AgentInvoker>,
    executor: ActionExecutor,
    rng: StdRng,
    event_tx: Option<Sender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl CycleScheduler {
    /// Fails if the configuration does not validate.
    pub fn new(
        config: &AppConfig,
        store: Arc<ParticipationStore>,
        forum: Arc<dyn ForumStore>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Result<Self> {
        config.validate()?;
        let executor = ActionExecutor::new(forum, store.clone(), config.cycle.seen_refresh_limit);
        Ok(Self {
            cycle: config.cycle.clone(),
            agents: config.agents.clone(),
            store,
            invoker,
            executor,
            rng: StdRng::from_entropy(),
            event_tx: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_events(mut self, event_tx: Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deterministic shuffles and skip rolls.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run one full cycle. Never fails: per-turn errors are logged and
    /// recorded as failed turns.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let cycle_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("cycle", cycle_id = %cycle_id);
        self.run_cycle_inner(cycle_id).instrument(span).await
    }

    async fn run_cycle_inner(&mut self, cycle_id: String) -> CycleReport {
        let started_at = Utc::now();
        let mut order = self.agents.clone();
        order.shuffle(&mut self.rng);
        let names: Vec<String> = order.iter().map(|a| a.name.clone()).collect();

        tracing::info!("Starting cycle with order: {}", names.join(", "));
        self.emit(SchedulerEvent::CycleStarted {
            cycle_id: cycle_id.clone(),
            order: names.clone(),
        });

        let mut turns = Vec::with_capacity(order.len());
        let mut cancelled = false;

        for (position, agent) in order.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!("Cycle cancelled before {}", agent.name);
                cancelled = true;
                break;
            }

            let roll: f64 = self.rng.gen();
            let record = if roll < self.cycle.skip_probability {
                tracing::info!("{} sits out this cycle (roll {:.3})", agent.name, roll);
                self.sit_out(agent, &cycle_id).await
            } else {
                self.dispatch_turn(agent, Some(&cycle_id)).await
            };

            if let Some(record) = record {
                self.emit(SchedulerEvent::TurnCompleted(record.clone()));
                turns.push(record);
            }

            if position + 1 < order.len() {
                let delay = self.jitter();
                tracing::debug!("Waiting {:.1}s before next agent", delay.as_secs_f64());
                if !self.pause(delay).await {
                    cancelled = true;
                    break;
                }
            }
        }

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            order: names,
            turns,
            cancelled,
        };
        tracing::info!(
            "Cycle complete: {} turn(s), {} sat out, {} failed, {} post(s)",
            report.turns.len(),
            report.sat_out(),
            report.failed(),
            report.mutations()
        );
        self.emit(SchedulerEvent::CycleCompleted(report.clone()));
        report
    }

    /// Repeat cycles until cancelled, or until `max_cycles` have run.
    /// Returns the number of cycles started.
    pub async fn run_continuous(&mut self, max_cycles: Option<u64>) -> u64 {
        let interval = Duration::from_secs(self.cycle.cycle_interval_secs);
        let mut completed = 0;

        tracing::info!(
            "Running continuously: {} agent(s), interval {}s, skip probability {:.2}",
            self.agents.len(),
            self.cycle.cycle_interval_secs,
            self.cycle.skip_probability
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.run_cycle().await;
            completed += 1;

            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
            tracing::info!("Sleeping {}s until next cycle", interval.as_secs());
            if !self.pause(interval).await {
                break;
            }
        }

        tracing::info!("Scheduler stopped after {} cycle(s)", completed);
        completed
    }

    /// One turn for one configured agent, with no skip roll and no delay.
    pub async fn run_single_agent(&self, name: &str) -> Result<TurnRecord> {
        let agent = self
            .agents
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| anyhow::anyhow!("Unknown agent: {}", name))?;

        let record = self
            .dispatch_turn(agent, None)
            .await
            .ok_or_else(|| anyhow::anyhow!("Turn for {} could not be recorded", name))?;
        self.emit(SchedulerEvent::TurnCompleted(record.clone()));
        Ok(record)
    }

    fn jitter(&mut self) -> Duration {
        let (min, max) = (self.cycle.min_delay_secs, self.cycle.max_delay_secs);
        let secs = if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or_else(|e| {
            tracing::warn!("Unusable inter-turn delay {}s ({}); not waiting", secs, e);
            Duration::ZERO
        })
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!("Cancelled while waiting");
                false
            }
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn sit_out(&self, agent: &AgentProfile, cycle_id: &str) -> Option<TurnRecord> {
        let mut record = TurnRecord::new(&agent.name, Utc::now(), ActionKind::Skip);
        record.cycle_id = Some(cycle_id.to_string());
        record.rationale = Some(SAT_OUT_RATIONALE.to_string());
        self.persist(record).await
    }

    /// Run the agent's turn and record it. Returns `None` only when the
    /// record itself could not be written.
    async fn dispatch_turn(
        &self,
        agent: &AgentProfile,
        cycle_id: Option<&str>,
    ) -> Option<TurnRecord> {
        let dispatched_at = Utc::now();

        let mut record = match self.take_turn(agent).await {
            Ok((decision, outcome)) => {
                let mut record = TurnRecord::new(&agent.name, dispatched_at, decision.kind());
                record.target_item_id = decision.target();
                record.created_item_id = outcome.created_item_id;
                record.success = outcome.success;
                record.error = outcome.error;
                record.rationale =
                    Some(decision.rationale().to_string()).filter(|r| !r.is_empty());
                record
            }
            Err(e) => {
                tracing::error!("Turn for {} failed: {:#}", agent.name, e);
                let mut record = TurnRecord::new(&agent.name, dispatched_at, ActionKind::Skip);
                record.success = false;
                record.error = Some(format!("{:#}", e));
                record
            }
        };
        record.cycle_id = cycle_id.map(str::to_string);

        self.persist(record).await
    }

    async fn take_turn(&self, agent: &AgentProfile) -> Result<(Decision, TurnOutcome)> {
        let last_run = self.store.get_last_run(&agent.name)?;
        let seen = self.store.get_seen_items(&agent.name)?;
        let prompt = build_turn_prompt(last_run, &seen);

        let mut budget = ToolBudget::new(self.cycle.max_tool_calls);
        let decision = match self.invoker.run_turn(agent, &prompt, &mut budget).await {
            Ok(decision) => decision,
            Err(TurnError::BudgetExceeded(exceeded)) => {
                tracing::warn!("{}: {}; forcing skip", agent.name, exceeded);
                Decision::forced_skip(&exceeded)
            }
            Err(TurnError::Failed(e)) => return Err(e),
        };

        let outcome = self.executor.execute(&agent.name, &decision).await;
        Ok((decision, outcome))
    }

    /// Commit the record, then mark the forum's current items as seen. Every
    /// recorded turn refreshes, including sit-outs and failed turns.
    async fn persist(&self, record: TurnRecord) -> Option<TurnRecord> {
        match self.store.commit_turn(&record) {
            Ok(()) => {
                tracing::info!(
                    "{}: {} (success={}{})",
                    record.agent_name,
                    record.action_kind,
                    record.success,
                    record
                        .error
                        .as_deref()
                        .map(|e| format!(", error={}", e))
                        .unwrap_or_default()
                );
                self.executor.refresh_seen_logged(&record.agent_name).await;
                Some(record)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to record turn for {}; turn is lost: {:#}",
                    record.agent_name,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::SqliteForum;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records who was asked, always skips.
    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentInvoker for RecordingInvoker {
        async fn run_turn(
            &self,
            agent: &AgentProfile,
            _prompt: &str,
            _budget: &mut ToolBudget,
        ) -> Result<Decision, TurnError> {
            self.calls
                .lock()
                .map_err(|e| anyhow::anyhow!("poisoned: {}", e))?
                .push(agent.name.clone());
            Ok(Decision::skip("nothing to add"))
        }
    }

    fn config(names: &[&str], skip_probability: f64) -> AppConfig {
        let mut config = AppConfig::default();
        config.agents = names.iter().map(|n| AgentProfile::named(*n)).collect();
        config.cycle.skip_probability = skip_probability;
        config.cycle.min_delay_secs = 0.0;
        config.cycle.max_delay_secs = 0.0;
        config.cycle.cycle_interval_secs = 0;
        config
    }

    fn scheduler(
        config: &AppConfig,
        invoker: Arc<RecordingInvoker>,
    ) -> (CycleScheduler, Arc<ParticipationStore>) {
        let store = Arc::new(ParticipationStore::open_in_memory().expect("store"));
        let forum = Arc::new(SqliteForum::open_in_memory().expect("forum"));
        let scheduler = CycleScheduler::new(config, store.clone(), forum, invoker)
            .expect("scheduler")
            .with_seed(7);
        (scheduler, store)
    }

    #[tokio::test]
    async fn every_agent_is_invoked_once_without_skips() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, store) = scheduler(&config(&["a", "b", "c"], 0.0), invoker.clone());

        let report = scheduler.run_cycle().await;
        assert_eq!(report.turns.len(), 3);
        assert!(!report.cancelled);

        let mut called = invoker.calls.lock().expect("lock").clone();
        assert_eq!(report.order, called);
        called.sort();
        assert_eq!(called, vec!["a", "b", "c"]);
        assert_eq!(store.count_turns(None).expect("count"), 3);
        assert!(report
            .turns
            .iter()
            .all(|t| t.cycle_id.as_deref() == Some(report.cycle_id.as_str())));
    }

    #[tokio::test]
    async fn certain_skip_never_invokes() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, store) = scheduler(&config(&["a", "b"], 1.0), invoker.clone());

        let report = scheduler.run_cycle().await;
        assert_eq!(report.sat_out(), 2);
        assert!(invoker.calls.lock().expect("lock").is_empty());
        assert!(store.get_last_run("a").expect("read").is_some());
        assert!(store.get_last_run("b").expect("read").is_some());
    }

    #[tokio::test]
    async fn sitting_out_still_marks_listed_items_seen() {
        let store = Arc::new(ParticipationStore::open_in_memory().expect("store"));
        let forum = Arc::new(SqliteForum::open_in_memory().expect("forum"));
        let first = forum.create_item("one", "", "x").await.expect("create");
        let second = forum.create_item("two", "", "x").await.expect("create");
        let invoker = Arc::new(RecordingInvoker::default());
        let config = config(&["a"], 1.0);
        let mut scheduler =
            CycleScheduler::new(&config, store.clone(), forum, invoker).expect("scheduler");

        let report = scheduler.run_cycle().await;
        assert_eq!(report.sat_out(), 1);
        let seen = store.get_seen_items("a").expect("seen");
        assert_eq!(seen, [first, second].into_iter().collect());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_turn() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, store) = scheduler(&config(&["a", "b"], 0.0), invoker.clone());
        scheduler.cancellation_token().cancel();

        let report = scheduler.run_cycle().await;
        assert!(report.cancelled);
        assert!(report.turns.is_empty());
        assert_eq!(store.count_turns(None).expect("count"), 0);
        assert_eq!(scheduler.run_continuous(None).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_inter_turn_delay() {
        let mut config = config(&["a", "b"], 0.0);
        config.cycle.min_delay_secs = 3600.0;
        config.cycle.max_delay_secs = 3600.0;
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, _) = scheduler(&config, invoker.clone());

        let token = scheduler.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let report = scheduler.run_cycle().await;
        assert!(report.cancelled);
        assert_eq!(report.turns.len(), 1);
        assert_eq!(invoker.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn continuous_mode_runs_the_requested_cycles() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, store) = scheduler(&config(&["a", "b"], 0.0), invoker.clone());
        let (tx, rx) = flume::unbounded();
        scheduler = scheduler.with_events(tx);

        assert_eq!(scheduler.run_continuous(Some(2)).await, 2);
        assert_eq!(store.count_turns(None).expect("count"), 4);

        let completed = rx
            .drain()
            .filter(|event| matches!(event, SchedulerEvent::CycleCompleted(_)))
            .count();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn single_agent_run_skips_the_roll() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (scheduler, _) = scheduler(&config(&["a", "b"], 1.0), invoker.clone());

        let record = scheduler.run_single_agent("b").await.expect("turn");
        assert_eq!(record.agent_name, "b");
        assert_eq!(record.cycle_id, None);
        assert_eq!(record.rationale.as_deref(), Some("nothing to add"));
        assert_eq!(*invoker.calls.lock().expect("lock"), vec!["b".to_string()]);

        assert!(scheduler.run_single_agent("zed").await.is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(ParticipationStore::open_in_memory().expect("store"));
        let forum = Arc::new(SqliteForum::open_in_memory().expect("forum"));
        let invoker = Arc::new(RecordingInvoker::default());
        let empty = config(&[], 0.0);
        let rejected = CycleScheduler::new(&empty, store.clone(), forum.clone(), invoker.clone());
        assert!(rejected.is_err());

        let mut unbounded = config(&["a"], 0.0);
        unbounded.cycle.min_delay_secs = f64::INFINITY;
        unbounded.cycle.max_delay_secs = f64::INFINITY;
        assert!(CycleScheduler::new(&unbounded, store, forum, invoker).is_err());
    }

    #[test]
    fn unusable_delay_does_not_wait() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (mut scheduler, _) = scheduler(&config(&["a"], 0.0), invoker);

        scheduler.cycle.min_delay_secs = f64::INFINITY;
        scheduler.cycle.max_delay_secs = f64::INFINITY;
        assert_eq!(scheduler.jitter(), Duration::ZERO);

        scheduler.cycle.min_delay_secs = 2.0;
        scheduler.cycle.max_delay_secs = 2.0;
        assert_eq!(scheduler.jitter(), Duration::from_secs(2));
    }
}
