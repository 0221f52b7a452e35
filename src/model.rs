/// Persisted data model: delegation events, sessions, agent profiles and the
/// store root that ties them together, plus the read-only query views the
/// dashboard consumes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Format tag written into every store file. Anything else is rejected on load.
pub const FORMAT_VERSION: &str = "1.0";

/// Ticket key used when the orchestrator could not extract one.
pub const UNKNOWN_TICKET: &str = "unknown";

/// Free-form caller metadata attached to a session.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A metadata value restricted to a small closed set of kinds so that
/// serialization stays deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    Map(BTreeMap<String, MetadataValue>),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Number(n)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Number(n as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Outcome of a single delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Error,
    Timeout,
    Blocked,
}

impl EventStatus {
    pub fn is_success(self) -> bool {
        self == EventStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Error => "error",
            EventStatus::Timeout => "timeout",
            EventStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finalized delegation. Immutable once appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub agent: String,
    pub session_id: String,
    pub ticket: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: EventStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub model: String,
}

/// One top-level run of the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub agents_invoked: Vec<String>,
    #[serde(default)]
    pub tickets_worked: Vec<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub event_ids: Vec<String>,
}

/// Status tag carried by a session until it is ended.
pub const SESSION_ACTIVE: &str = "active";

impl Session {
    /// Create an open session starting now.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status: SESSION_ACTIVE.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            metadata,
            agents_invoked: Vec::new(),
            tickets_worked: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            event_ids: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Wall-clock duration; open sessions are measured up to now.
    pub fn duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        secs_between(self.started_at, end)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            kind: self.kind.clone(),
            status: self.status.clone(),
            agents_invoked: self.agents_invoked.clone(),
            tickets_worked: self.tickets_worked.clone(),
            total_tokens: self.total_tokens,
            total_cost_usd: self.total_cost_usd,
            duration_secs: self.duration_secs(),
            event_count: self.event_ids.len(),
        }
    }
}

/// Read-only view returned when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: String,
    pub status: String,
    pub agents_invoked: Vec<String>,
    pub tickets_worked: Vec<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub duration_secs: f64,
    pub event_count: usize,
}

impl SessionSummary {
    /// No-op summary for a session id that was never open.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: String::new(),
            status: "unknown".to_string(),
            agents_invoked: Vec::new(),
            tickets_worked: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            duration_secs: 0.0,
            event_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0 && self.kind.is_empty()
    }
}

/// One entry of an agent's rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingSample {
    pub success: bool,
    pub duration_secs: f64,
    pub tokens: u64,
}

impl From<&Event> for RollingSample {
    fn from(event: &Event) -> Self {
        Self {
            success: event.status.is_success(),
            duration_secs: event.duration_secs,
            tokens: event.total_tokens,
        }
    }
}

/// Cumulative statistics for one agent. Never evicted.
///
/// `success_rate`, `avg_tokens_per_call` and `avg_duration_secs` are written
/// out for readers of the file but are always recomputed from the counters
/// via [`AgentProfile::refresh_derived`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent: String,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub total_duration_secs: f64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_tokens_per_call: f64,
    #[serde(default)]
    pub avg_duration_secs: f64,
    #[serde(default)]
    pub achievements: BTreeSet<String>,
    #[serde(default)]
    pub xp: u64,
    #[serde(default = "first_level")]
    pub level: u32,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub best_streak: u32,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recent: VecDeque<RollingSample>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
}

fn first_level() -> u32 {
    1
}

impl AgentProfile {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            total_invocations: 0,
            successful_invocations: 0,
            failed_invocations: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            total_duration_secs: 0.0,
            success_rate: 0.0,
            avg_tokens_per_call: 0.0,
            avg_duration_secs: 0.0,
            achievements: BTreeSet::new(),
            xp: 0,
            level: first_level(),
            current_streak: 0,
            best_streak: 0,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
            recent: VecDeque::new(),
            last_active: None,
        }
    }

    /// Recompute every derived field from the cumulative counters.
    pub fn refresh_derived(&mut self) {
        if self.total_invocations == 0 {
            self.success_rate = 0.0;
            self.avg_tokens_per_call = 0.0;
            self.avg_duration_secs = 0.0;
            return;
        }
        let total = self.total_invocations as f64;
        self.success_rate = self.successful_invocations as f64 / total;
        self.avg_tokens_per_call = self.total_tokens as f64 / total;
        self.avg_duration_secs = self.total_duration_secs / total;
    }
}

/// Aggregate rollup across every agent and retained session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub project_name: String,
    pub total_agents: usize,
    pub total_sessions: usize,
    pub open_sessions: usize,
    pub retained_events: usize,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub success_rate: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub top_agent: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The single JSON document persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRoot {
    pub version: String,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
}

impl StoreRoot {
    /// A fresh, empty root for the given project.
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: FORMAT_VERSION.to_string(),
            project_name: project_name.into(),
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            sessions: Vec::new(),
            agents: BTreeMap::new(),
        }
    }

    pub fn global_summary(&self) -> GlobalSummary {
        let mut total_invocations = 0;
        let mut successful_invocations = 0;
        let mut failed_invocations = 0;
        let mut total_tokens = 0;
        let mut total_cost_usd = 0.0;
        for profile in self.agents.values() {
            total_invocations += profile.total_invocations;
            successful_invocations += profile.successful_invocations;
            failed_invocations += profile.failed_invocations;
            total_tokens += profile.total_tokens;
            total_cost_usd += profile.total_cost_usd;
        }

        let success_rate = if total_invocations == 0 {
            0.0
        } else {
            successful_invocations as f64 / total_invocations as f64
        };

        GlobalSummary {
            project_name: self.project_name.clone(),
            total_agents: self.agents.len(),
            total_sessions: self.sessions.len(),
            open_sessions: self.sessions.iter().filter(|s| s.is_open()).count(),
            retained_events: self.events.len(),
            total_invocations,
            successful_invocations,
            failed_invocations,
            success_rate,
            total_tokens,
            total_cost_usd: crate::pricing::round_usd(total_cost_usd),
            top_agent: self.list_agents().first().map(|p| p.agent.clone()),
            updated_at: self.updated_at,
        }
    }

    pub fn agent_profile(&self, name: &str) -> Option<AgentProfile> {
        self.agents.get(name).cloned()
    }

    /// Profiles ordered by XP descending, ties broken by name.
    pub fn list_agents(&self) -> Vec<AgentProfile> {
        let mut agents: Vec<AgentProfile> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| b.xp.cmp(&a.xp).then_with(|| a.agent.cmp(&b.agent)));
        agents
    }

    /// The newest `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub(crate) fn open_session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id && s.is_open())
    }
}

pub(crate) fn secs_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let ms = (end - start).num_milliseconds().max(0);
    ms as f64 / 1000.0
}
