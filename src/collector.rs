/// Session and delegation lifecycle on top of the durable store.
///
/// The collector owns the in-memory [`StoreRoot`] behind a mutex. Every
/// state change is folded in memory first and then persisted; a failed write
/// is reported but never rolls the in-memory state back. The file is not
/// re-read before saving, so only one collector may own a given store file.
use crate::aggregate::{compute_cost, fold_event_into_profile, fold_event_into_session};
use crate::config::MetricsConfig;
use crate::model::{
    secs_between, AgentProfile, Event, EventStatus, GlobalSummary, Metadata, Session,
    SessionSummary, StoreRoot, UNKNOWN_TICKET,
};
use crate::pricing::PricingTable;
use crate::rules::{RuleEngines, Traits};
use crate::store::{Recovery, Store, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Tunables that are not part of the store itself.
#[derive(Debug)]
pub struct CollectorOptions {
    pub pricing: PricingTable,
    pub engines: RuleEngines,
    /// XP for a successful delegation before streak bonuses.
    pub xp_base: u64,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            pricing: PricingTable::builtin(),
            engines: RuleEngines::default(),
            xp_base: 10,
        }
    }
}

/// Everything a closed tracker produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationOutcome {
    pub event: Event,
    pub xp_awarded: u64,
    pub level: u32,
    pub leveled_up: bool,
    pub new_achievements: BTreeSet<String>,
    pub traits: Traits,
}

/// Stateful metrics façade. Construct one per store file and share it by
/// reference; two collectors on the same file overwrite each other's events.
#[derive(Debug)]
pub struct Collector {
    store: Store,
    pricing: PricingTable,
    engines: RuleEngines,
    xp_base: u64,
    state: Mutex<StoreRoot>,
    recovered: Option<Recovery>,
}

impl Collector {
    /// Load the store (recovering from corruption) and wrap it.
    pub fn new(store: Store, options: CollectorOptions) -> Self {
        let loaded = store.load();
        Self {
            store,
            pricing: options.pricing,
            engines: options.engines,
            xp_base: options.xp_base,
            state: Mutex::new(loaded.root),
            recovered: loaded.recovered,
        }
    }

    /// Build a collector from loaded configuration.
    pub fn open(config: &MetricsConfig, data_dir: &Path) -> Self {
        let store = Store::new(config.store_path(data_dir), config.project.name.clone())
            .with_caps(config.store.max_events, config.store.max_sessions);
        let options = CollectorOptions {
            pricing: config.pricing.table(),
            engines: RuleEngines::default(),
            xp_base: config.xp.base_success,
        };
        Self::new(store, options)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Set when the store had to be recovered at startup.
    pub fn recovery(&self) -> Option<&Recovery> {
        self.recovered.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreRoot> {
        // A panic inside a tracker scope must not disable metrics for the
        // rest of the process.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, root: &mut StoreRoot) -> Result<(), StoreError> {
        root.updated_at = Utc::now();
        self.store.save(root)
    }

    /// Open a new session with a generated id.
    pub fn start_session(
        &self,
        kind: &str,
        metadata: Metadata,
    ) -> Result<String, CollectorError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.start_session_with_id(&id, kind, metadata)?;
        Ok(id)
    }

    /// Open a session under a caller-chosen id. Rejects any id already in
    /// the store, open or closed.
    pub fn start_session_with_id(
        &self,
        id: &str,
        kind: &str,
        metadata: Metadata,
    ) -> Result<(), CollectorError> {
        let mut root = self.lock();
        if root.sessions.iter().any(|s| s.id == id) {
            return Err(CollectorError::InvalidState(format!(
                "session {id} already exists"
            )));
        }

        let evicted = self
            .store
            .append_session(&mut root, Session::new(id, kind, metadata));
        if evicted > 0 {
            debug!(evicted, "evicted oldest sessions");
        }
        info!(session_id = id, kind, "session started");

        if let Err(e) = self.persist(&mut root) {
            warn!(error = %e, session_id = id, "failed to persist session start");
        }
        Ok(())
    }

    /// Close a session and return its summary.
    ///
    /// Unknown or already-closed ids are logged and answered with an empty
    /// summary. A storage failure is returned as [`CollectorError::Persist`]
    /// but the session stays closed in memory.
    pub fn end_session(&self, id: &str, status: &str) -> Result<SessionSummary, CollectorError> {
        let mut root = self.lock();
        let summary = match root.open_session_mut(id) {
            Some(session) => {
                session.ended_at = Some(Utc::now());
                session.status = status.to_string();
                session.summary()
            }
            None => {
                warn!(session_id = id, "end_session for unknown or closed session");
                return Ok(SessionSummary::empty(id));
            }
        };

        info!(
            session_id = id,
            status,
            events = summary.event_count,
            total_tokens = summary.total_tokens,
            cost_usd = summary.total_cost_usd,
            "session ended"
        );

        self.persist(&mut root)
            .map_err(|source| CollectorError::Persist { source })?;
        Ok(summary)
    }

    /// Open a tracker for one delegation. The tracker records an event when
    /// it is finished or dropped.
    pub fn track_agent(
        &self,
        agent: &str,
        ticket: Option<&str>,
        model: &str,
        session_id: &str,
    ) -> Tracker<'_> {
        let ticket = match ticket.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => UNKNOWN_TICKET.to_string(),
        };
        debug!(agent, ticket = %ticket, session_id, "delegation started");
        Tracker {
            collector: self,
            pending: Some(PendingEvent {
                id: uuid::Uuid::new_v4().to_string(),
                agent: agent.to_string(),
                session_id: session_id.to_string(),
                ticket,
                model: model.to_string(),
                started_at: Utc::now(),
                input_tokens: 0,
                output_tokens: 0,
                artifacts: Vec::new(),
                error_message: None,
                status: None,
            }),
        }
    }

    fn close_delegation(
        &self,
        pending: PendingEvent,
        abnormal: Option<&str>,
    ) -> Result<DelegationOutcome, CollectorError> {
        let event = pending.finalize(&self.pricing, abnormal);
        let mut root = self.lock();

        let evicted = self.store.append_event(&mut root, event.clone());
        if evicted > 0 {
            debug!(evicted, "evicted oldest events");
        }

        let previous = root
            .agents
            .get(&event.agent)
            .cloned()
            .unwrap_or_else(|| AgentProfile::new(event.agent.clone()));
        let mut profile = fold_event_into_profile(&previous, &event);

        let mut xp_awarded = 0;
        if event.status.is_success() {
            let award = self
                .engines
                .xp
                .award_xp(self.xp_base, profile.current_streak, profile.xp);
            xp_awarded = award.xp_delta;
            profile.xp += award.xp_delta;
            profile.level = award.new_level.max(profile.level);
        }
        let leveled_up = profile.level > previous.level;
        if leveled_up {
            info!(agent = %event.agent, level = profile.level, "agent leveled up");
        }

        let earned = self.engines.achievements.check_achievements(&profile, &event);
        let new_achievements: BTreeSet<String> =
            earned.difference(&profile.achievements).cloned().collect();
        for id in &new_achievements {
            info!(agent = %event.agent, achievement = %id, "achievement unlocked");
        }
        profile.achievements.extend(new_achievements.iter().cloned());

        let traits = self
            .engines
            .strengths
            .update_rolling_stats(&mut profile, &event);

        let level = profile.level;
        root.agents.insert(event.agent.clone(), profile);

        match root.open_session_mut(&event.session_id) {
            Some(session) => *session = fold_event_into_session(session, &event),
            None => warn!(
                session_id = %event.session_id,
                event_id = %event.id,
                "event recorded for unknown or closed session"
            ),
        }

        debug!(
            agent = %event.agent,
            status = %event.status,
            total_tokens = event.total_tokens,
            cost_usd = event.cost_usd,
            duration_secs = event.duration_secs,
            "delegation finished"
        );

        self.persist(&mut root)
            .map_err(|source| CollectorError::Persist { source })?;

        Ok(DelegationOutcome {
            event,
            xp_awarded,
            level,
            leveled_up,
            new_achievements,
            traits,
        })
    }

    // --- Read-only snapshot accessors ---

    pub fn get_global_summary(&self) -> GlobalSummary {
        self.lock().global_summary()
    }

    pub fn get_agent_profile(&self, name: &str) -> Option<AgentProfile> {
        self.lock().agent_profile(name)
    }

    pub fn list_agents(&self) -> Vec<AgentProfile> {
        self.lock().list_agents()
    }

    /// Newest events first.
    pub fn get_recent_events(&self, limit: usize) -> Vec<Event> {
        self.lock().recent_events(limit)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.lock().session(id)
    }

    /// Owned copy of the whole in-memory root.
    pub fn snapshot(&self) -> StoreRoot {
        self.lock().clone()
    }
}

/// Event data accumulated while a tracker is open.
#[derive(Debug)]
struct PendingEvent {
    id: String,
    agent: String,
    session_id: String,
    ticket: String,
    model: String,
    started_at: DateTime<Utc>,
    input_tokens: u64,
    output_tokens: u64,
    artifacts: Vec<String>,
    error_message: Option<String>,
    status: Option<EventStatus>,
}

impl PendingEvent {
    /// `abnormal` carries the reason when the scope ended without `finish`.
    fn finalize(self, pricing: &PricingTable, abnormal: Option<&str>) -> Event {
        let ended_at = Utc::now().max(self.started_at);
        let error_message = self
            .error_message
            .or_else(|| abnormal.map(str::to_string));
        let status = match self.status {
            Some(status) => status,
            None if error_message.is_some() => EventStatus::Error,
            None => EventStatus::Success,
        };
        let cost_usd = compute_cost(pricing, &self.model, self.input_tokens, self.output_tokens);

        Event {
            id: self.id,
            agent: self.agent,
            session_id: self.session_id,
            ticket: self.ticket,
            started_at: self.started_at,
            ended_at,
            duration_secs: secs_between(self.started_at, ended_at),
            status,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            cost_usd,
            artifacts: self.artifacts,
            error_message,
            model: self.model,
        }
    }
}

/// Scoped handle for one in-flight delegation.
///
/// Call [`finish`](Self::finish) to close it and see the outcome. A tracker
/// dropped without `finish` (an early `?` return or a panic) still records
/// its event, as an error.
#[derive(Debug)]
pub struct Tracker<'c> {
    collector: &'c Collector,
    pending: Option<PendingEvent>,
}

impl Tracker<'_> {
    /// Id the event will be stored under.
    pub fn event_id(&self) -> &str {
        self.pending.as_ref().map(|p| p.id.as_str()).unwrap_or("")
    }

    /// Set the cumulative token counts observed so far. Later calls replace
    /// earlier ones.
    pub fn add_tokens(&mut self, input: u64, output: u64) {
        if let Some(p) = self.pending.as_mut() {
            p.input_tokens = input;
            p.output_tokens = output;
        }
    }

    pub fn add_artifact(&mut self, tag: impl Into<String>) {
        if let Some(p) = self.pending.as_mut() {
            p.artifacts.push(tag.into());
        }
    }

    /// Mark the delegation failed. The tracker stays open.
    pub fn set_error(&mut self, message: impl Into<String>) {
        if let Some(p) = self.pending.as_mut() {
            p.error_message = Some(message.into());
        }
    }

    /// Force a final status, e.g. `Timeout` when the orchestrator gave up.
    pub fn set_status(&mut self, status: EventStatus) {
        if let Some(p) = self.pending.as_mut() {
            p.status = Some(status);
        }
    }

    /// Close the tracker, record the event and return what it produced.
    pub fn finish(mut self) -> Result<DelegationOutcome, CollectorError> {
        match self.pending.take() {
            Some(pending) => self.collector.close_delegation(pending, None),
            None => Err(CollectorError::InvalidState(
                "tracker already closed".to_string(),
            )),
        }
    }
}

impl Drop for Tracker<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            let reason = if std::thread::panicking() {
                "delegation scope panicked"
            } else {
                "delegation scope exited without finish"
            };
            if let Err(e) = self.collector.close_delegation(pending, Some(reason)) {
                warn!(error = %e, "failed to record delegation on drop");
            }
        }
    }
}

/// Errors surfaced by the collector.
#[derive(Debug)]
pub enum CollectorError {
    /// Caller broke the lifecycle contract, e.g. reused a session id.
    InvalidState(String),
    /// State was updated in memory but could not be written to disk.
    Persist { source: StoreError },
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::InvalidState(msg) => write!(f, "invalid collector state: {msg}"),
            CollectorError::Persist { source } => {
                write!(f, "failed to persist metrics: {source}")
            }
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::InvalidState(_) => None,
            CollectorError::Persist { source } => Some(source),
        }
    }
}
