//! A/B fork state machine.
//!
//! A session is either in `Idle` (no fork) or has exactly one active fork
//! with two branches. `commit` replaces everything after the base entry with
//! the chosen branch; `discard` drops both branches and leaves main as it was
//! before the fork started.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirage_core::history::{
    BranchLabel, EntryKind, ForkEntryStatus, GeneratedImage, HistoryEntry,
};
use mirage_core::ids::{BranchId, EntryId, ForkId, SessionId};
use serde::Serialize;

use crate::error::StoreError;
use crate::session::{Pending, Session};

pub(crate) struct Branch {
    pub id: BranchId,
    pub label: BranchLabel,
    pub instructions: Option<String>,
    pub suffix: Vec<Arc<HistoryEntry>>,
    pub prev_html: String,
    pub pending: Pending,
    pub images: HashMap<String, GeneratedImage>,
}

impl Branch {
    fn new(
        id: BranchId,
        label: BranchLabel,
        instructions: Option<String>,
        prev_html: String,
        pending: Pending,
    ) -> Self {
        Self {
            id,
            label,
            instructions,
            suffix: Vec::new(),
            prev_html,
            pending,
            images: HashMap::new(),
        }
    }
}

pub(crate) struct ActiveFork {
    pub fork_id: ForkId,
    pub base_entry_id: EntryId,
    /// Number of main entries shared by both branches.
    pub base_len: usize,
    pub created_at: DateTime<Utc>,
    pub branches: [Branch; 2],
}

impl ActiveFork {
    pub fn branch_index(&self, branch_id: &BranchId) -> Option<usize> {
        self.branches.iter().position(|b| &b.id == branch_id)
    }
}

/// Identifiers handed back when a fork starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkHandle {
    pub fork_id: ForkId,
    pub base_entry_id: EntryId,
    pub branch_a: BranchId,
    pub branch_b: BranchId,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummary {
    pub branch_id: BranchId,
    pub label: BranchLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub entry_count: usize,
}

/// Read-only view of an active fork.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSummary {
    pub session_id: SessionId,
    pub fork_id: ForkId,
    pub base_entry_id: EntryId,
    pub created_at: DateTime<Utc>,
    pub branches: Vec<BranchSummary>,
}

/// Ids the store mints for a new fork.
pub(crate) struct ForkIds {
    pub fork_id: ForkId,
    pub branch_a: BranchId,
    pub branch_b: BranchId,
}

impl Session {
    pub(crate) fn start_fork(
        &mut self,
        base_entry_id: Option<&EntryId>,
        instructions_a: Option<String>,
        instructions_b: Option<String>,
        ids: ForkIds,
        now: DateTime<Utc>,
    ) -> Result<ForkHandle, StoreError> {
        if let Some(active) = &self.fork {
            return Err(StoreError::ForkAlreadyActive(active.fork_id.clone()));
        }
        let base_idx = match base_entry_id {
            Some(id) => self
                .main
                .iter()
                .position(|e| &e.id == id)
                .ok_or_else(|| StoreError::NoSuchEntry(id.clone()))?,
            None => self.main.len().checked_sub(1).ok_or(StoreError::EmptyHistory)?,
        };
        let base_len = base_idx + 1;
        let base_entry_id = self.main[base_idx].id.clone();

        let prefix_html = self.main[..base_len]
            .iter()
            .rev()
            .find(|e| e.entry_kind == EntryKind::Html)
            .map(|e| e.response.html.clone())
            .unwrap_or_default();

        let handle = ForkHandle {
            fork_id: ids.fork_id.clone(),
            base_entry_id: base_entry_id.clone(),
            branch_a: ids.branch_a.clone(),
            branch_b: ids.branch_b.clone(),
        };
        self.fork = Some(ActiveFork {
            fork_id: ids.fork_id,
            base_entry_id,
            base_len,
            created_at: now,
            branches: [
                Branch::new(
                    ids.branch_a,
                    BranchLabel::A,
                    normalize(instructions_a),
                    prefix_html.clone(),
                    self.pending.clone(),
                ),
                Branch::new(
                    ids.branch_b,
                    BranchLabel::B,
                    normalize(instructions_b),
                    prefix_html,
                    self.pending.clone(),
                ),
            ],
        });
        Ok(handle)
    }

    /// Promote `branch_id` to main. Entries after the base are replaced by
    /// the branch's entries, restamped with `chosen` status.
    pub(crate) fn commit_fork(&mut self, fork_id: &ForkId, branch_id: &BranchId) -> Result<usize, StoreError> {
        let idx = {
            let fork = self.active_fork(fork_id)?;
            fork.branch_index(branch_id)
                .ok_or_else(|| StoreError::NoSuchBranch(branch_id.clone()))?
        };
        let Some(fork) = self.fork.take() else {
            return Err(StoreError::NoSuchFork(fork_id.clone()));
        };
        let [a, b] = fork.branches;
        let chosen = if idx == 0 { a } else { b };

        self.main.truncate(fork.base_len);
        let committed = chosen.suffix.len();
        self.main.extend(chosen.suffix.into_iter().map(|entry| {
            let mut entry = Arc::unwrap_or_clone(entry);
            if let Some(info) = entry.fork_info.as_mut() {
                info.status = ForkEntryStatus::Chosen;
            }
            Arc::new(entry)
        }));
        self.prev_html = chosen.prev_html;
        // The chosen branch inherited main's pending records at start.
        self.pending = chosen.pending;
        self.images.extend(chosen.images);
        Ok(committed)
    }

    pub(crate) fn discard_fork(&mut self, fork_id: &ForkId) -> Result<(), StoreError> {
        self.active_fork(fork_id)?;
        self.fork = None;
        Ok(())
    }

    pub fn fork_summary(&self) -> Option<ForkSummary> {
        let fork = self.fork.as_ref()?;
        Some(ForkSummary {
            session_id: self.id.clone(),
            fork_id: fork.fork_id.clone(),
            base_entry_id: fork.base_entry_id.clone(),
            created_at: fork.created_at,
            branches: fork
                .branches
                .iter()
                .map(|b| BranchSummary {
                    branch_id: b.id.clone(),
                    label: b.label,
                    instructions: b.instructions.clone(),
                    entry_count: b.suffix.len(),
                })
                .collect(),
        })
    }

    /// Instructions attached to `branch_id` of the active fork.
    pub(crate) fn branch_instructions(&self, branch_id: &BranchId) -> Option<String> {
        let fork = self.fork.as_ref()?;
        let idx = fork.branch_index(branch_id)?;
        fork.branches[idx].instructions.clone()
    }

    fn active_fork(&self, fork_id: &ForkId) -> Result<&ActiveFork, StoreError> {
        match &self.fork {
            Some(fork) if &fork.fork_id == fork_id => Ok(fork),
            _ => Err(StoreError::NoSuchFork(fork_id.clone())),
        }
    }
}

fn normalize(instructions: Option<String>) -> Option<String> {
    instructions
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Target;
    use mirage_core::history::{EntryDraft, RequestInfo, RestMutationRecord};
    use mirage_core::ids::RecordId;

    fn session_with(n: usize) -> Session {
        let mut s = Session::new(SessionId::from_raw("sess_1"), Utc::now());
        for i in 1..=n {
            let entry = page(&s, Target::Main, &format!("entry_{i}"));
            s.append(Target::Main, entry);
        }
        s
    }

    fn page(s: &Session, target: Target, id: &str) -> HistoryEntry {
        let request = RequestInfo {
            method: "GET".into(),
            path: format!("/{id}"),
            ..Default::default()
        };
        EntryDraft::html(request, format!("<p>{id}</p>")).into_entry(
            EntryId::from_raw(id),
            s.id.clone(),
            Utc::now(),
            s.fork_info(target),
        )
    }

    fn ids() -> ForkIds {
        ForkIds {
            fork_id: ForkId::from_raw("fork_1"),
            branch_a: BranchId::from_raw("branch_a"),
            branch_b: BranchId::from_raw("branch_b"),
        }
    }

    fn main_ids(s: &Session) -> Vec<String> {
        s.main.iter().map(|e| e.id.to_string()).collect()
    }

    #[test]
    fn start_on_empty_history_fails() {
        let mut s = session_with(0);
        let err = s.start_fork(None, None, None, ids(), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::EmptyHistory));
        assert!(!s.is_fork_active());
    }

    #[test]
    fn start_with_unknown_base_fails() {
        let mut s = session_with(2);
        let err = s
            .start_fork(Some(&EntryId::from_raw("entry_9")), None, None, ids(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchEntry(_)));
    }

    #[test]
    fn second_start_is_rejected() {
        let mut s = session_with(1);
        s.start_fork(None, None, None, ids(), Utc::now()).unwrap();
        let err = s.start_fork(None, None, None, ids(), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::ForkAlreadyActive(_)));
    }

    #[test]
    fn commit_replaces_tail_after_base() {
        let mut s = session_with(3);
        let base = EntryId::from_raw("entry_2");
        let handle = s
            .start_fork(Some(&base), Some("  dark mode ".into()), Some("   ".into()), ids(), Utc::now())
            .unwrap();
        let a = Target::Branch(0);
        let entry = page(&s, a, "entry_a1");
        s.append(a, entry);

        let summary = s.fork_summary().unwrap();
        assert_eq!(summary.branches[0].instructions.as_deref(), Some("dark mode"));
        assert_eq!(summary.branches[1].instructions, None);
        assert_eq!(summary.branches[0].entry_count, 1);

        let committed = s.commit_fork(&handle.fork_id, &handle.branch_a).unwrap();
        assert_eq!(committed, 1);
        assert_eq!(main_ids(&s), vec!["entry_1", "entry_2", "entry_a1"]);
        let info = s.main[2].fork_info.as_ref().unwrap();
        assert_eq!(info.status, ForkEntryStatus::Chosen);
        assert_eq!(s.prev_html(Target::Main), "<p>entry_a1</p>");
        assert!(!s.is_fork_active());
    }

    #[test]
    fn discard_leaves_main_untouched() {
        let mut s = session_with(2);
        let before = main_ids(&s);
        let handle = s.start_fork(None, None, None, ids(), Utc::now()).unwrap();
        let b = Target::Branch(1);
        let entry = page(&s, b, "entry_b1");
        s.append(b, entry);
        s.discard_fork(&handle.fork_id).unwrap();
        assert_eq!(main_ids(&s), before);
        assert!(s.fork_summary().is_none());
    }

    #[test]
    fn commit_with_wrong_ids_fails() {
        let mut s = session_with(1);
        let handle = s.start_fork(None, None, None, ids(), Utc::now()).unwrap();
        let err = s
            .commit_fork(&ForkId::from_raw("fork_other"), &handle.branch_a)
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchFork(_)));
        let err = s
            .commit_fork(&handle.fork_id, &BranchId::from_raw("branch_x"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchBranch(_)));
        assert!(s.is_fork_active());
    }

    #[test]
    fn branches_share_prefix_and_isolate_suffixes() {
        let mut s = session_with(2);
        s.start_fork(None, None, None, ids(), Utc::now()).unwrap();
        let a = Target::Branch(0);
        let entry = page(&s, a, "entry_a1");
        s.append(a, entry);

        let a_ids: Vec<_> = s.timeline(a).iter().map(|e| e.id.to_string()).collect();
        let b_ids: Vec<_> = s.timeline(Target::Branch(1)).iter().map(|e| e.id.to_string()).collect();
        assert_eq!(a_ids, vec!["entry_1", "entry_2", "entry_a1"]);
        assert_eq!(b_ids, vec!["entry_1", "entry_2"]);
        assert_eq!(main_ids(&s), vec!["entry_1", "entry_2"]);
    }

    fn pending_mutation(s: &mut Session) {
        s.pending_mut(Target::Main).mutations.push(RestMutationRecord {
            id: RecordId::from_raw("rec_1"),
            path: "/todos".into(),
            method: "POST".into(),
            query: Default::default(),
            body: Default::default(),
            created_at: Utc::now(),
        });
    }

    #[test]
    fn pending_records_follow_the_chosen_branch() {
        let mut s = session_with(1);
        pending_mutation(&mut s);
        let handle = s.start_fork(None, None, None, ids(), Utc::now()).unwrap();

        let a = Target::Branch(0);
        let entry = page(&s, a, "entry_a1");
        let first = s.append(a, entry);
        assert_eq!(first.rest_mutations.len(), 1);
        assert_eq!(first.rest_mutations[0].path, "/todos");

        // Branch B still holds its own copy until it renders.
        let b = Target::Branch(1);
        let entry = page(&s, b, "entry_b1");
        assert_eq!(s.append(b, entry).rest_mutations.len(), 1);

        s.commit_fork(&handle.fork_id, &handle.branch_a).unwrap();
        assert_eq!(s.main[1].rest_mutations.len(), 1);
        let entry = page(&s, Target::Main, "entry_2");
        assert!(s.append(Target::Main, entry).rest_mutations.is_empty());
    }

    #[test]
    fn discard_keeps_pending_records_on_main() {
        let mut s = session_with(1);
        pending_mutation(&mut s);
        let handle = s.start_fork(None, None, None, ids(), Utc::now()).unwrap();
        let a = Target::Branch(0);
        let entry = page(&s, a, "entry_a1");
        s.append(a, entry);
        s.discard_fork(&handle.fork_id).unwrap();

        let entry = page(&s, Target::Main, "entry_2");
        let next = s.append(Target::Main, entry);
        assert_eq!(next.rest_mutations.len(), 1);
        assert_eq!(next.rest_mutations[0].id, RecordId::from_raw("rec_1"));
    }
}
