/// Durable JSON store for events, sessions and agent profiles.
///
/// Writes go to a temp file in the same directory which is then renamed over
/// the real path, so readers only ever see the old or the new document.
/// A file that cannot be parsed is moved aside to `<name>.corrupted` and the
/// caller continues with an empty root.
use crate::model::{Event, Session, StoreRoot, FORMAT_VERSION};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_MAX_EVENTS: usize = 500;
pub const DEFAULT_MAX_SESSIONS: usize = 50;

/// Handle on the backing file plus its retention caps.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    project_name: String,
    max_events: usize,
    max_sessions: usize,
}

/// What `load` did when the backing file could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub reason: String,
    /// Where the unreadable file was moved, if it was moved.
    pub backup: Option<PathBuf>,
}

/// Result of a recovering load.
#[derive(Debug)]
pub struct Loaded {
    pub root: StoreRoot,
    pub recovered: Option<Recovery>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>, project_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            project_name: project_name.into(),
            max_events: DEFAULT_MAX_EVENTS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Override the retention caps.
    pub fn with_caps(mut self, max_events: usize, max_sessions: usize) -> Self {
        self.max_events = max_events;
        self.max_sessions = max_sessions;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// A fresh root for this store's project.
    pub fn empty_root(&self) -> StoreRoot {
        StoreRoot::new(self.project_name.clone())
    }

    /// Strict load: a missing file is an empty root, anything unreadable is an error.
    pub fn try_load(&self) -> Result<StoreRoot, StoreError> {
        if !self.path.exists() {
            return Ok(self.empty_root());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| StoreError::Read {
            path: self.path.clone(),
            source: e,
        })?;

        let value: serde_json::Value =
            serde_json::from_str(&contents).map_err(|e| StoreError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        match value.get("version").and_then(|v| v.as_str()) {
            Some(FORMAT_VERSION) => {}
            found => {
                return Err(StoreError::UnsupportedVersion {
                    path: self.path.clone(),
                    found: found.map(str::to_string),
                })
            }
        }

        let mut root: StoreRoot =
            serde_json::from_value(value).map_err(|e| StoreError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        for profile in root.agents.values_mut() {
            profile.refresh_derived();
        }
        truncate_front(&mut root.events, self.max_events);
        truncate_front(&mut root.sessions, self.max_sessions);
        Ok(root)
    }

    /// Recovering load: never fails.
    ///
    /// Unparseable or wrong-version files are moved to a `.corrupted` backup.
    /// Read errors leave the file in place. Either way an empty root is
    /// returned along with a [`Recovery`] describing what happened.
    pub fn load(&self) -> Loaded {
        match self.try_load() {
            Ok(root) => Loaded {
                root,
                recovered: None,
            },
            Err(e @ StoreError::Read { .. }) => {
                tracing::warn!(error = %e, "metrics store unreadable, starting empty");
                Loaded {
                    root: self.empty_root(),
                    recovered: Some(Recovery {
                        reason: e.to_string(),
                        backup: None,
                    }),
                }
            }
            Err(e) => {
                let backup = self.quarantine();
                tracing::warn!(
                    error = %e,
                    backup = ?backup,
                    "metrics store corrupted, backed up and starting empty"
                );
                Loaded {
                    root: self.empty_root(),
                    recovered: Some(Recovery {
                        reason: e.to_string(),
                        backup,
                    }),
                }
            }
        }
    }

    /// Read-only load for query surfaces: errors degrade to an empty root
    /// without touching the file, since readers do not own it.
    pub fn peek(&self) -> StoreRoot {
        self.try_load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read metrics store");
            self.empty_root()
        })
    }

    /// Move the current file to a `.corrupted` backup path.
    fn quarantine(&self) -> Option<PathBuf> {
        let backup = self.backup_path();
        match std::fs::rename(&self.path, &backup) {
            Ok(()) => Some(backup),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    from = %self.path.display(),
                    to = %backup.display(),
                    "failed to back up corrupted metrics store"
                );
                None
            }
        }
    }

    fn backup_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "metrics.json".to_string());
        let plain = self.path.with_file_name(format!("{name}.corrupted"));
        if !plain.exists() {
            return plain;
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.path.with_file_name(format!("{name}.corrupted.{stamp}"))
    }

    /// Serialize `root` into a temp file next to the store, ready to be
    /// renamed into place by [`StagedWrite::commit`].
    pub fn stage(&self, root: &StoreRoot) -> Result<StagedWrite, StoreError> {
        let json =
            serde_json::to_string_pretty(root).map_err(|e| StoreError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::CreateDir {
            path: dir.clone(),
            source: e,
        })?;

        let write_err = |source: std::io::Error| StoreError::Write {
            path: dir.clone(),
            source,
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".metrics.")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(write_err)?;
        restrict_permissions(tmp.as_file()).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        Ok(StagedWrite {
            tmp,
            target: self.path.clone(),
        })
    }

    /// Atomically replace the backing file with `root`.
    pub fn save(&self, root: &StoreRoot) -> Result<(), StoreError> {
        self.stage(root)?.commit()
    }

    /// Append an event, evicting the oldest beyond the cap. Returns the
    /// number of events evicted.
    pub fn append_event(&self, root: &mut StoreRoot, event: Event) -> usize {
        root.events.push(event);
        truncate_front(&mut root.events, self.max_events)
    }

    /// Append a session, evicting the oldest beyond the cap. Returns the
    /// number of sessions evicted.
    pub fn append_session(&self, root: &mut StoreRoot, session: Session) -> usize {
        root.sessions.push(session);
        truncate_front(&mut root.sessions, self.max_sessions)
    }
}

/// A fully written temp file waiting to be renamed over the store.
///
/// Dropping it without calling [`commit`](Self::commit) deletes the temp
/// file and leaves the store untouched.
#[derive(Debug)]
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Rename the temp file over the store path.
    pub fn commit(self) -> Result<(), StoreError> {
        let from = self.tmp.path().to_path_buf();
        self.tmp
            .persist(&self.target)
            .map_err(|e| StoreError::Rename {
                from,
                to: self.target.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}

fn truncate_front<T>(items: &mut Vec<T>, cap: usize) -> usize {
    let excess = items.len().saturating_sub(cap);
    if excess > 0 {
        items.drain(..excess);
    }
    excess
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

/// Errors from store operations.
#[derive(Debug)]
pub enum StoreError {
    /// File exists but is not a valid store document.
    Corrupted { path: PathBuf, reason: String },
    /// File parsed but carries an unknown or missing format version.
    UnsupportedVersion {
        path: PathBuf,
        found: Option<String>,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    /// True for errors that the recovering load treats as corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupted { .. } | StoreError::UnsupportedVersion { .. }
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Corrupted { path, reason } => {
                write!(f, "metrics store {} is corrupted: {reason}", path.display())
            }
            StoreError::UnsupportedVersion { path, found } => write!(
                f,
                "metrics store {} has unsupported version {} (expected {FORMAT_VERSION})",
                path.display(),
                found.as_deref().unwrap_or("<missing>")
            ),
            StoreError::Read { path, source } => {
                write!(f, "failed to read metrics store {}: {source}", path.display())
            }
            StoreError::Serialize { source } => {
                write!(f, "failed to serialize metrics store: {source}")
            }
            StoreError::CreateDir { path, source } => {
                write!(f, "failed to create directory {}: {source}", path.display())
            }
            StoreError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp store file in {}: {source}",
                    path.display()
                )
            }
            StoreError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Corrupted { .. } | StoreError::UnsupportedVersion { .. } => None,
            StoreError::Read { source, .. } => Some(source),
            StoreError::Serialize { source } => Some(source),
            StoreError::CreateDir { source, .. } => Some(source),
            StoreError::Write { source, .. } => Some(source),
            StoreError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentProfile, EventStatus, Metadata, UNKNOWN_TICKET};
    use tempfile::tempdir;

    fn event(id: &str) -> Event {
        let now = Utc::now();
        Event {
            id: id.to_string(),
            agent: "coding".to_string(),
            session_id: "s1".to_string(),
            ticket: UNKNOWN_TICKET.to_string(),
            started_at: now,
            ended_at: now,
            duration_secs: 0.25,
            status: EventStatus::Success,
            input_tokens: 100,
            output_tokens: 200,
            total_tokens: 300,
            cost_usd: 0.0033,
            artifacts: vec!["src/lib.rs".to_string()],
            error_message: None,
            model: "sonnet".to_string(),
        }
    }

    fn populated_root(store: &Store) -> StoreRoot {
        let mut root = store.empty_root();
        store.append_event(&mut root, event("e1"));
        let mut meta = Metadata::new();
        meta.insert("iteration".to_string(), 3i64.into());
        store.append_session(&mut root, Session::new("s1", "coding", meta));
        let mut profile = AgentProfile::new("coding");
        profile.total_invocations = 1;
        profile.successful_invocations = 1;
        profile.total_tokens = 300;
        profile.total_cost_usd = 0.0033;
        profile.total_duration_secs = 0.25;
        profile.achievements.insert("first_success".to_string());
        profile.refresh_derived();
        root.agents.insert("coding".to_string(), profile);
        root
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "tmp"))
            .collect()
    }

    #[test]
    fn test_load_missing_file_returns_empty_root() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        let loaded = store.load();
        assert!(loaded.recovered.is_none());
        assert_eq!(loaded.root.version, FORMAT_VERSION);
        assert_eq!(loaded.root.project_name, "proj");
        assert!(loaded.root.events.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        let root = populated_root(&store);

        store.save(&root).unwrap();
        let loaded = store.load();
        assert!(loaded.recovered.is_none());
        assert_eq!(loaded.root, root);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_round_trip_preserves_float_totals_exactly() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        for i in 1..200u64 {
            let mut root = populated_root(&store);
            let profile = root.agents.get_mut("coding").unwrap();
            profile.total_invocations = i;
            profile.successful_invocations = i;
            profile.total_duration_secs = (i as f64).sqrt() * 1234.567_891;
            profile.total_cost_usd = 1.0 / (i as f64 + 7.0);
            profile.refresh_derived();
            root.events[0].duration_secs = 0.1 * i as f64 + 0.2;

            store.save(&root).unwrap();
            assert_eq!(store.load().root, root, "mismatch at iteration {i}");
        }
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("nested/deeper/metrics.json"), "proj");
        store.save(&store.empty_root()).unwrap();
        assert!(store.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        store.save(&store.empty_root()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_interrupted_save_leaves_file_unchanged() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        let original = populated_root(&store);
        store.save(&original).unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let mut changed = original.clone();
        store.append_event(&mut changed, event("e2"));
        let staged = store.stage(&changed).unwrap();
        let tmp = staged.temp_path().to_path_buf();
        assert!(tmp.exists());
        drop(staged);

        assert!(!tmp.exists(), "abandoned temp file should be removed");
        let after = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.load().root, original);
    }

    #[test]
    fn test_failed_save_reports_error() {
        let dir = tempdir().unwrap();
        // A regular file where a directory is expected.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let store = Store::new(blocker.join("metrics.json"), "proj");

        let err = store.save(&store.empty_root()).unwrap_err();
        assert!(matches!(err, StoreError::CreateDir { .. }));
        assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "x");
    }

    #[test]
    fn test_corrupted_file_is_backed_up_and_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{\"version\": \"1.0\", \"events\": [tru").unwrap();
        let store = Store::new(&path, "proj");

        let loaded = store.load();
        assert!(loaded.root.events.is_empty());
        assert!(loaded.root.agents.is_empty());
        let recovery = loaded.recovered.expect("recovery should be reported");
        let backup = recovery.backup.expect("backup should be written");
        assert_eq!(backup, dir.path().join("metrics.json.corrupted"));
        assert_eq!(
            std::fs::read_to_string(&backup).unwrap(),
            "{\"version\": \"1.0\", \"events\": [tru"
        );
        assert!(!path.exists());

        store.save(&loaded.root).unwrap();
        let reloaded = store.load();
        assert!(reloaded.recovered.is_none());
        assert_eq!(reloaded.root, loaded.root);
    }

    #[test]
    fn test_second_corruption_does_not_overwrite_first_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let store = Store::new(&path, "proj");

        std::fs::write(&path, "garbage one").unwrap();
        let first = store.load().recovered.unwrap().backup.unwrap();
        std::fs::write(&path, "garbage two").unwrap();
        let second = store.load().recovered.unwrap().backup.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(first).unwrap(), "garbage one");
        assert_eq!(std::fs::read_to_string(second).unwrap(), "garbage two");
    }

    #[test]
    fn test_unknown_version_takes_corruption_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let store = Store::new(&path, "proj");
        let mut root = store.empty_root();
        root.version = "9.9".to_string();
        std::fs::write(&path, serde_json::to_string(&root).unwrap()).unwrap();

        let err = store.try_load().unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("9.9"));

        let loaded = store.load();
        assert!(loaded.recovered.unwrap().backup.is_some());
        assert!(!path.exists());
    }

    #[test]
    fn test_peek_does_not_move_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "not json").unwrap();
        let store = Store::new(&path, "proj");

        let root = store.peek();
        assert!(root.events.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_load_recomputes_derived_fields() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("metrics.json"), "proj");
        let mut root = populated_root(&store);
        root.agents.get_mut("coding").unwrap().success_rate = 0.1;
        store.save(&root).unwrap();

        let loaded = store.load().root;
        assert_eq!(loaded.agents["coding"].success_rate, 1.0);
    }

    #[test]
    fn test_event_cap_keeps_newest() {
        let store = Store::new("unused.json", "proj");
        let mut root = store.empty_root();
        let mut evicted = 0;
        for i in 0..501 {
            evicted += store.append_event(&mut root, event(&format!("e{i}")));
        }
        assert_eq!(evicted, 1);
        assert_eq!(root.events.len(), 500);
        assert_eq!(root.events.first().unwrap().id, "e1");
        assert_eq!(root.events.last().unwrap().id, "e500");
    }

    #[test]
    fn test_session_cap_is_independent() {
        let store = Store::new("unused.json", "proj").with_caps(3, 2);
        let mut root = store.empty_root();
        for i in 0..4 {
            let session = Session::new(format!("s{i}"), "coding", Metadata::new());
            store.append_session(&mut root, session);
        }
        store.append_event(&mut root, event("e0"));
        assert_eq!(root.sessions.len(), 2);
        assert_eq!(root.sessions[0].id, "s2");
        assert_eq!(root.events.len(), 1);
    }

    #[test]
    fn test_load_applies_lowered_caps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let wide = Store::new(&path, "proj");
        let mut root = wide.empty_root();
        for i in 0..10 {
            wide.append_event(&mut root, event(&format!("e{i}")));
        }
        wide.save(&root).unwrap();

        let narrow = Store::new(&path, "proj").with_caps(4, 50);
        let loaded = narrow.load().root;
        assert_eq!(loaded.events.len(), 4);
        assert_eq!(loaded.events[0].id, "e6");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Write {
            path: PathBuf::from("/tmp/test"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no perms"),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to write temp store file"));
        assert!(msg.contains("no perms"));
        assert!(!err.is_corruption());
    }
}
