//! Per-session state: the main timeline, an optional active fork, and the
//! records that are waiting to be folded into the next rendered page.
//!
//! A fork never copies the main timeline. Each branch is described by the
//! shared prefix `main[..base_len]` plus its own suffix, and `main` is not
//! written while the fork is active, so the prefix stays valid until commit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirage_core::history::{
    EntryKind, ForkEntryStatus, ForkInfo, GeneratedImage, HistoryEntry, RestMutationRecord,
    RestQueryRecord,
};
use mirage_core::ids::{BranchId, SessionId};

use crate::error::StoreError;
use crate::fork::ActiveFork;

/// REST records and images recorded since the last page render.
#[derive(Clone, Debug, Default)]
pub(crate) struct Pending {
    pub mutations: Vec<RestMutationRecord>,
    pub queries: Vec<RestQueryRecord>,
    pub images: Vec<GeneratedImage>,
}

impl Pending {
    fn drain_into(&mut self, entry: &mut HistoryEntry) {
        entry.rest_mutations.append(&mut self.mutations);
        entry.rest_queries.append(&mut self.queries);
        entry.generated_images.append(&mut self.images);
    }
}

/// Where a read or write lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Main,
    Branch(usize),
}

pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub(crate) main: Vec<Arc<HistoryEntry>>,
    pub(crate) prev_html: String,
    pub(crate) pending: Pending,
    pub(crate) images: HashMap<String, GeneratedImage>,
    pub(crate) fork: Option<ActiveFork>,
}

impl Session {
    pub fn new(id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_accessed_at: now,
            main: Vec::new(),
            prev_html: String::new(),
            pending: Pending::default(),
            images: HashMap::new(),
            fork: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }

    pub fn is_fork_active(&self) -> bool {
        self.fork.is_some()
    }

    /// Resolve the timeline a write goes to.
    ///
    /// While a fork is active every write must name one of its branches.
    /// Without a fork a stale branch id is ignored and the write goes to main.
    pub(crate) fn write_target(&self, branch: Option<&BranchId>) -> Result<Target, StoreError> {
        match (&self.fork, branch) {
            (None, None) => Ok(Target::Main),
            (None, Some(branch_id)) => {
                tracing::debug!(session_id = %self.id, branch_id = %branch_id, "branch id without active fork, writing to main");
                Ok(Target::Main)
            }
            (Some(_), None) => Err(StoreError::ForkRouting(self.id.clone())),
            (Some(fork), Some(branch_id)) => fork
                .branch_index(branch_id)
                .map(Target::Branch)
                .ok_or_else(|| StoreError::NoSuchBranch(branch_id.clone())),
        }
    }

    /// Resolve the timeline a read comes from; unknown branches read main.
    pub(crate) fn read_target(&self, branch: Option<&BranchId>) -> Target {
        match (&self.fork, branch) {
            (Some(fork), Some(branch_id)) => fork
                .branch_index(branch_id)
                .map_or(Target::Main, Target::Branch),
            _ => Target::Main,
        }
    }

    /// Main history only.
    pub fn history(&self) -> Vec<Arc<HistoryEntry>> {
        self.main.clone()
    }

    pub(crate) fn timeline(&self, target: Target) -> Vec<Arc<HistoryEntry>> {
        match (target, &self.fork) {
            (Target::Branch(idx), Some(fork)) => {
                let branch = &fork.branches[idx];
                let mut out = Vec::with_capacity(fork.base_len + branch.suffix.len());
                out.extend(self.main[..fork.base_len].iter().cloned());
                out.extend(branch.suffix.iter().cloned());
                out
            }
            _ => self.main.clone(),
        }
    }

    pub(crate) fn prev_html(&self, target: Target) -> String {
        let (stored, last) = match (target, &self.fork) {
            (Target::Branch(idx), Some(fork)) => {
                let branch = &fork.branches[idx];
                let last = branch
                    .suffix
                    .last()
                    .or_else(|| self.main[..fork.base_len].last());
                (&branch.prev_html, last)
            }
            _ => (&self.prev_html, self.main.last()),
        };
        if !stored.is_empty() {
            return stored.clone();
        }
        last.map(|e| e.response.html.clone()).unwrap_or_default()
    }

    pub(crate) fn set_prev_html(&mut self, target: Target, html: String) {
        match (target, &mut self.fork) {
            (Target::Branch(idx), Some(fork)) => fork.branches[idx].prev_html = html,
            _ => self.prev_html = html,
        }
    }

    /// Fork membership stamped on entries written to `target`.
    pub(crate) fn fork_info(&self, target: Target) -> Option<ForkInfo> {
        match (target, &self.fork) {
            (Target::Branch(idx), Some(fork)) => {
                let branch = &fork.branches[idx];
                Some(ForkInfo {
                    fork_id: fork.fork_id.clone(),
                    branch_id: branch.id.clone(),
                    label: branch.label,
                    status: ForkEntryStatus::InProgress,
                })
            }
            _ => None,
        }
    }

    /// Append a fully stamped entry. Page renders pick up the pending REST
    /// records and images of their timeline and become its previous HTML.
    pub(crate) fn append(&mut self, target: Target, mut entry: HistoryEntry) -> Arc<HistoryEntry> {
        let is_page = entry.entry_kind == EntryKind::Html;
        match (target, &mut self.fork) {
            (Target::Branch(idx), Some(fork)) => {
                let branch = &mut fork.branches[idx];
                if is_page {
                    branch.pending.drain_into(&mut entry);
                    branch.prev_html = entry.response.html.clone();
                }
                let entry = Arc::new(entry);
                branch.suffix.push(Arc::clone(&entry));
                entry
            }
            _ => {
                if is_page {
                    self.pending.drain_into(&mut entry);
                    self.prev_html = entry.response.html.clone();
                }
                let entry = Arc::new(entry);
                self.main.push(Arc::clone(&entry));
                entry
            }
        }
    }

    pub(crate) fn pending_mut(&mut self, target: Target) -> &mut Pending {
        match (target, &mut self.fork) {
            (Target::Branch(idx), Some(fork)) => &mut fork.branches[idx].pending,
            _ => &mut self.pending,
        }
    }

    pub(crate) fn images_mut(&mut self, target: Target) -> &mut HashMap<String, GeneratedImage> {
        match (target, &mut self.fork) {
            (Target::Branch(idx), Some(fork)) => &mut fork.branches[idx].images,
            _ => &mut self.images,
        }
    }

    /// Images registered on the main timeline, oldest first.
    pub fn generated_images(&self) -> Vec<GeneratedImage> {
        let mut images: Vec<_> = self.images.values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        images
    }

    /// Replace the main timeline wholesale (snapshot import).
    pub(crate) fn replace_main(&mut self, entries: Vec<HistoryEntry>, images: Vec<GeneratedImage>) {
        self.main = entries.into_iter().map(Arc::new).collect();
        self.prev_html = self
            .main
            .iter()
            .rev()
            .find(|e| e.entry_kind == EntryKind::Html)
            .map(|e| e.response.html.clone())
            .unwrap_or_default();
        self.pending = Pending::default();
        self.images = images.into_iter().map(|img| (img.cache_key.clone(), img)).collect();
    }
}
