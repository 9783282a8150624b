use mirage_core::ids::{BranchId, EntryId, ForkId, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such session: {0}")]
    NoSuchSession(SessionId),

    #[error("session {0} has an active fork; writes must name a branch")]
    ForkRouting(SessionId),

    #[error("a fork ({0}) is already active for this session")]
    ForkAlreadyActive(ForkId),

    #[error("no such fork: {0}")]
    NoSuchFork(ForkId),

    #[error("no such branch: {0}")]
    NoSuchBranch(BranchId),

    #[error("no such history entry: {0}")]
    NoSuchEntry(EntryId),

    #[error("session has no history to fork from")]
    EmptyHistory,

    #[error("cannot export or import while a fork is active; commit or discard it first")]
    ForkActive,

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoSuchSession(_) => "no_such_session",
            Self::ForkRouting(_) => "fork_routing",
            Self::ForkAlreadyActive(_) => "fork_already_active",
            Self::NoSuchFork(_) => "no_such_fork",
            Self::NoSuchBranch(_) => "no_such_branch",
            Self::NoSuchEntry(_) => "no_such_entry",
            Self::EmptyHistory => "empty_history",
            Self::ForkActive => "fork_active",
            Self::InvalidSnapshot(_) => "invalid_snapshot",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::InvalidSnapshot(e.to_string())
    }
}
