use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mirage_core::clock::{Clock, IdGenerator};
use mirage_core::history::{
    EntryDraft, GeneratedImage, HistoryEntry, JsonMap, RestMetadata, RestMutationRecord,
    RestQueryRecord,
};
use mirage_core::ids::{BranchId, EntryId, ForkId, RecordId, SessionId};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::error::StoreError;
use crate::fork::{ForkHandle, ForkIds, ForkSummary};
use crate::session::{Session, Target};
use crate::snapshot::{HistorySnapshot, SnapshotMeta, SNAPSHOT_VERSION};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Idle time after which a session is evicted; `None` keeps sessions
    /// until the cap pushes them out.
    pub session_ttl: Option<Duration>,
    /// Maximum number of live sessions.
    pub session_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl: None,
            session_cap: 200,
        }
    }
}

/// The method, path and sanitized parameters of one virtual REST call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestCall {
    pub method: String,
    pub path: String,
    pub query: JsonMap,
    pub body: JsonMap,
}

/// Result of asking the model to answer a virtual query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryOutcome {
    pub ok: bool,
    pub response: Value,
    pub raw_response: String,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub entry_count: usize,
    pub fork_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub over_cap: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.over_cap
    }
}

struct SessionSlot {
    session: Mutex<Session>,
    in_flight: AtomicUsize,
}

impl SessionSlot {
    fn is_leased(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }
}

/// Keeps a session alive while a request is using it. The sweeper never
/// evicts a session with an outstanding lease.
pub struct SessionLease {
    id: SessionId,
    is_new: bool,
    slot: Arc<SessionSlot>,
}

impl SessionLease {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True when this lease created the session (the caller should set the cookie).
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("is_new", &self.is_new)
            .finish()
    }
}

/// In-memory session registry.
///
/// Each session sits behind its own mutex; the map itself is only locked long
/// enough to clone the slot handle, so no session lock is ever held while the
/// map is being written (except by eviction, which takes the map shard first).
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SessionStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            clock,
            ids,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    /// Resolve the session named by a cookie value, creating a fresh one when
    /// the cookie is missing or unknown. Touches `last_accessed_at`.
    pub fn open_session(&self, cookie: Option<&str>) -> SessionLease {
        let now = self.clock.now();
        if let Some(raw) = cookie.map(str::trim).filter(|s| !s.is_empty()) {
            let id = SessionId::from_raw(raw);
            if let Some(lease) = self.try_lease(&id, now) {
                return lease;
            }
        }

        let id = SessionId::from_raw(self.ids.next_id(SessionId::PREFIX));
        let slot = Arc::new(SessionSlot {
            session: Mutex::new(Session::new(id.clone(), now)),
            in_flight: AtomicUsize::new(1),
        });
        let _ = self.sessions.insert(id.clone(), Arc::clone(&slot));
        tracing::debug!(session_id = %id, "session created");

        let evicted = self.enforce_cap();
        if evicted > 0 {
            tracing::info!(evicted, cap = self.config.session_cap, "sessions evicted over cap");
        }
        SessionLease {
            id,
            is_new: true,
            slot,
        }
    }

    pub fn get_or_create_session_id(&self, cookie: Option<&str>) -> (SessionId, bool) {
        let lease = self.open_session(cookie);
        (lease.id().clone(), lease.is_new())
    }

    fn try_lease(&self, id: &SessionId, now: DateTime<Utc>) -> Option<SessionLease> {
        let slot = {
            let guard = self.sessions.get(id)?;
            let slot = Arc::clone(guard.value());
            slot.in_flight.fetch_add(1, Ordering::AcqRel);
            slot
        };
        slot.session.lock().touch(now);
        Some(SessionLease {
            id: id.clone(),
            is_new: false,
            slot,
        })
    }

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>, StoreError> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| StoreError::NoSuchSession(id.clone()))
    }

    fn with_session<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let slot = self.slot(id)?;
        let now = self.clock.now();
        let mut session = slot.session.lock();
        session.touch(now);
        f(&mut session, now)
    }

    fn read_session<T>(&self, id: &SessionId, f: impl FnOnce(&Session) -> T) -> Result<T, StoreError> {
        let slot = self.slot(id)?;
        let session = slot.session.lock();
        Ok(f(&session))
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let slots: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out: Vec<_> = slots
            .iter()
            .map(|slot| {
                let s = slot.session.lock();
                SessionSummary {
                    session_id: s.id.clone(),
                    entry_count: s.main.len(),
                    fork_active: s.is_fork_active(),
                    created_at: s.created_at,
                    last_accessed_at: s.last_accessed_at,
                }
            })
            .collect();
        out.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        out
    }

    // ── History ──────────────────────────────────────────────────────────

    /// Stamp and append an entry to the timeline `branch` resolves to.
    #[instrument(skip(self, draft), fields(session_id = %id, kind = ?draft.kind))]
    pub fn append_history_entry(
        &self,
        id: &SessionId,
        draft: EntryDraft,
        branch: Option<&BranchId>,
    ) -> Result<Arc<HistoryEntry>, StoreError> {
        self.with_session(id, |session, now| {
            let target = session.write_target(branch)?;
            Ok(self.append_locked(session, target, draft, now))
        })
    }

    fn append_locked(
        &self,
        session: &mut Session,
        target: Target,
        draft: EntryDraft,
        now: DateTime<Utc>,
    ) -> Arc<HistoryEntry> {
        let entry_id = EntryId::from_raw(self.ids.next_id(EntryId::PREFIX));
        let fork_info = session.fork_info(target);
        let entry = draft.into_entry(entry_id, session.id.clone(), now, fork_info);
        session.append(target, entry)
    }

    /// Main history only.
    pub fn get_history(&self, id: &SessionId) -> Result<Vec<Arc<HistoryEntry>>, StoreError> {
        self.read_session(id, Session::history)
    }

    /// The timeline a prompt for `branch` should see: prefix plus branch
    /// entries when `branch` names a branch of the active fork, else main.
    pub fn get_history_for_prompt(
        &self,
        id: &SessionId,
        branch: Option<&BranchId>,
    ) -> Result<Vec<Arc<HistoryEntry>>, StoreError> {
        self.read_session(id, |s| s.timeline(s.read_target(branch)))
    }

    pub fn get_prev_html(&self, id: &SessionId, branch: Option<&BranchId>) -> Result<String, StoreError> {
        self.read_session(id, |s| s.prev_html(s.read_target(branch)))
    }

    pub fn set_prev_html(
        &self,
        id: &SessionId,
        html: impl Into<String>,
        branch: Option<&BranchId>,
    ) -> Result<(), StoreError> {
        let html = html.into();
        self.with_session(id, |session, _| {
            let target = session.write_target(branch)?;
            session.set_prev_html(target, html);
            Ok(())
        })
    }

    /// Fail with the error a write routed by `branch` would hit, without
    /// writing anything.
    pub fn check_write_target(&self, id: &SessionId, branch: Option<&BranchId>) -> Result<(), StoreError> {
        let target = self.read_session(id, |s| s.write_target(branch))?;
        target.map(|_| ())
    }

    /// Per-branch instructions of the active fork, if `branch` names one.
    pub fn branch_instructions(&self, id: &SessionId, branch: Option<&BranchId>) -> Result<Option<String>, StoreError> {
        self.read_session(id, |s| branch.and_then(|b| s.branch_instructions(b)))
    }

    // ── REST records ─────────────────────────────────────────────────────

    #[instrument(skip(self, call), fields(session_id = %id, path = %call.path))]
    pub fn append_mutation_record(
        &self,
        id: &SessionId,
        call: &RestCall,
        branch: Option<&BranchId>,
    ) -> Result<RestMutationRecord, StoreError> {
        self.with_session(id, |session, now| {
            let target = session.write_target(branch)?;
            let record = self.mutation_record(call, now);
            session.pending_mut(target).mutations.push(record.clone());
            Ok(record)
        })
    }

    #[instrument(skip(self, call, outcome), fields(session_id = %id, path = %call.path, ok = outcome.ok))]
    pub fn append_query_record(
        &self,
        id: &SessionId,
        call: &RestCall,
        outcome: QueryOutcome,
        branch: Option<&BranchId>,
    ) -> Result<RestQueryRecord, StoreError> {
        self.with_session(id, |session, now| {
            let target = session.write_target(branch)?;
            let record = self.query_record(call, outcome, now);
            session.pending_mut(target).queries.push(record.clone());
            Ok(record)
        })
    }

    /// Append a `rest-mutation`/`rest-query` entry describing a REST call.
    pub fn append_rest_history_entry(
        &self,
        id: &SessionId,
        rest: RestMetadata,
        branch: Option<&BranchId>,
    ) -> Result<Arc<HistoryEntry>, StoreError> {
        self.append_history_entry(id, EntryDraft::rest(rest), branch)
    }

    /// Record a mutation and its history entry under one lock, so a fork
    /// starting in between cannot split them across timelines.
    /// `draft` is normally built with [`EntryDraft::rest`].
    #[instrument(skip(self, call, draft), fields(session_id = %id, path = %call.path))]
    pub fn record_mutation(
        &self,
        id: &SessionId,
        call: &RestCall,
        draft: EntryDraft,
        branch: Option<&BranchId>,
    ) -> Result<(RestMutationRecord, Arc<HistoryEntry>), StoreError> {
        self.with_session(id, |session, now| {
            let target = session.write_target(branch)?;
            let record = self.mutation_record(call, now);
            session.pending_mut(target).mutations.push(record.clone());
            let entry = self.append_locked(session, target, draft, now);
            Ok((record, entry))
        })
    }

    /// Query counterpart of [`record_mutation`](Self::record_mutation).
    #[instrument(skip(self, call, outcome, draft), fields(session_id = %id, path = %call.path, ok = outcome.ok))]
    pub fn record_query(
        &self,
        id: &SessionId,
        call: &RestCall,
        outcome: QueryOutcome,
        draft: EntryDraft,
        branch: Option<&BranchId>,
    ) -> Result<(RestQueryRecord, Arc<HistoryEntry>), StoreError> {
        self.with_session(id, |session, now| {
            let target = session.write_target(branch)?;
            let record = self.query_record(call, outcome, now);
            session.pending_mut(target).queries.push(record.clone());
            let entry = self.append_locked(session, target, draft, now);
            Ok((record, entry))
        })
    }

    fn mutation_record(&self, call: &RestCall, now: DateTime<Utc>) -> RestMutationRecord {
        RestMutationRecord {
            id: RecordId::from_raw(self.ids.next_id(RecordId::PREFIX)),
            path: call.path.clone(),
            method: call.method.clone(),
            query: call.query.clone(),
            body: call.body.clone(),
            created_at: now,
        }
    }

    fn query_record(&self, call: &RestCall, outcome: QueryOutcome, now: DateTime<Utc>) -> RestQueryRecord {
        RestQueryRecord {
            id: RecordId::from_raw(self.ids.next_id(RecordId::PREFIX)),
            path: call.path.clone(),
            method: call.method.clone(),
            query: call.query.clone(),
            body: call.body.clone(),
            created_at: now,
            ok: outcome.ok,
            response: outcome.response,
            raw_response: outcome.raw_response,
            error: outcome.error,
        }
    }

    // ── Generated images ─────────────────────────────────────────────────

    /// Register an image with the timeline `branch` resolves to. Recording
    /// the same cache key again replaces the earlier registration.
    #[instrument(skip(self, image), fields(session_id = %id, cache_key = %image.cache_key))]
    pub fn record_generated_image(
        &self,
        id: &SessionId,
        image: GeneratedImage,
        branch: Option<&BranchId>,
    ) -> Result<(), StoreError> {
        self.with_session(id, |session, _| {
            let target = session.write_target(branch)?;
            session.pending_mut(target).images.push(image.clone());
            let _ = session.images_mut(target).insert(image.cache_key.clone(), image);
            Ok(())
        })
    }

    pub fn generated_images(&self, id: &SessionId) -> Result<Vec<GeneratedImage>, StoreError> {
        self.read_session(id, Session::generated_images)
    }

    // ── Forks ────────────────────────────────────────────────────────────

    #[instrument(skip(self, instructions_a, instructions_b), fields(session_id = %id))]
    pub fn start_fork(
        &self,
        id: &SessionId,
        base_entry_id: Option<&EntryId>,
        instructions_a: Option<String>,
        instructions_b: Option<String>,
    ) -> Result<ForkHandle, StoreError> {
        self.with_session(id, |session, now| {
            let ids = ForkIds {
                fork_id: ForkId::from_raw(self.ids.next_id(ForkId::PREFIX)),
                branch_a: BranchId::from_raw(self.ids.next_id(BranchId::PREFIX)),
                branch_b: BranchId::from_raw(self.ids.next_id(BranchId::PREFIX)),
            };
            let handle = session.start_fork(base_entry_id, instructions_a, instructions_b, ids, now)?;
            tracing::info!(fork_id = %handle.fork_id, base_entry_id = %handle.base_entry_id, "fork started");
            Ok(handle)
        })
    }

    #[instrument(skip(self), fields(session_id = %id, fork_id = %fork_id, branch_id = %branch_id))]
    pub fn commit_fork(&self, id: &SessionId, fork_id: &ForkId, branch_id: &BranchId) -> Result<usize, StoreError> {
        self.with_session(id, |session, _| {
            let committed = session.commit_fork(fork_id, branch_id)?;
            tracing::info!(committed, "fork committed");
            Ok(committed)
        })
    }

    #[instrument(skip(self), fields(session_id = %id, fork_id = %fork_id))]
    pub fn discard_fork(&self, id: &SessionId, fork_id: &ForkId) -> Result<(), StoreError> {
        self.with_session(id, |session, _| {
            session.discard_fork(fork_id)?;
            tracing::info!("fork discarded");
            Ok(())
        })
    }

    pub fn is_fork_active(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.read_session(id, Session::is_fork_active)
    }

    pub fn active_fork_summary(&self, id: &SessionId) -> Result<Option<ForkSummary>, StoreError> {
        self.read_session(id, Session::fork_summary)
    }

    /// Find the session that owns an active fork.
    pub fn session_for_fork(&self, fork_id: &ForkId) -> Option<SessionId> {
        let slots: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        slots.iter().find_map(|slot| {
            let s = slot.session.lock();
            s.fork_summary()
                .filter(|f| &f.fork_id == fork_id)
                .map(|_| s.id.clone())
        })
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    #[instrument(skip(self, meta), fields(session_id = %id))]
    pub fn export_snapshot(&self, id: &SessionId, meta: SnapshotMeta) -> Result<HistorySnapshot, StoreError> {
        self.with_session(id, |session, now| {
            if session.is_fork_active() {
                return Err(StoreError::ForkActive);
            }
            Ok(HistorySnapshot {
                version: SNAPSHOT_VERSION,
                exported_at: now,
                brief: meta.brief,
                brief_attachments: meta.brief_attachments,
                history: session.main.iter().map(|e| HistoryEntry::clone(e)).collect(),
                runtime: meta.runtime,
                llm: meta.llm,
                generated_images: session.generated_images(),
            })
        })
    }

    /// Replace a session's main history with a snapshot's. Entries keep their
    /// ids, timestamps and content but are reassigned to `id`.
    #[instrument(skip(self, snapshot), fields(session_id = %id, entries = snapshot.history.len()))]
    pub fn import_snapshot(&self, id: &SessionId, snapshot: HistorySnapshot) -> Result<usize, StoreError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        self.with_session(id, |session, _| {
            if session.is_fork_active() {
                return Err(StoreError::ForkActive);
            }
            let entries: Vec<HistoryEntry> = snapshot
                .history
                .into_iter()
                .map(|mut e| {
                    e.session_id = id.clone();
                    e
                })
                .collect();
            let count = entries.len();
            session.replace_main(entries, snapshot.generated_images);
            tracing::info!(count, "snapshot imported");
            Ok(count)
        })
    }

    // ── Eviction ─────────────────────────────────────────────────────────

    /// Remove sessions idle longer than the TTL. Leased sessions are skipped.
    pub fn evict_expired(&self) -> usize {
        let Some(ttl) = self.config.session_ttl else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = self.clock.now() - ttl;
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| !e.value().is_leased())
            .filter(|e| e.value().session.try_lock().is_some_and(|s| s.last_accessed_at < cutoff))
            .map(|e| e.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| self.remove_if_idle(id, |s| s.last_accessed_at < cutoff))
            .inspect(|id| tracing::debug!(session_id = %id, "session expired"))
            .count()
    }

    /// Evict least-recently-used sessions until the count is within the cap.
    pub fn enforce_cap(&self) -> usize {
        let cap = self.config.session_cap;
        let len = self.sessions.len();
        if len <= cap {
            return 0;
        }
        let mut candidates: Vec<(DateTime<Utc>, SessionId)> = self
            .sessions
            .iter()
            .filter(|e| !e.value().is_leased())
            .filter_map(|e| {
                let s = e.value().session.try_lock()?;
                Some((s.last_accessed_at, e.key().clone()))
            })
            .collect();
        candidates.sort();

        let mut evicted = 0;
        for (_, id) in candidates {
            if self.sessions.len() <= cap {
                break;
            }
            if self.remove_if_idle(&id, |_| true) {
                tracing::debug!(session_id = %id, "session evicted over cap");
                evicted += 1;
            }
        }
        evicted
    }

    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            expired: self.evict_expired(),
            over_cap: self.enforce_cap(),
        }
    }

    /// Remove a session while holding both its map shard and its lock, and
    /// only if nobody holds a lease on it.
    fn remove_if_idle(&self, id: &SessionId, pred: impl Fn(&MutexGuard<'_, Session>) -> bool) -> bool {
        self.sessions
            .remove_if(id, |_, slot| {
                if slot.is_leased() {
                    return false;
                }
                let guard = slot.session.lock();
                pred(&guard)
            })
            .is_some()
    }
}
