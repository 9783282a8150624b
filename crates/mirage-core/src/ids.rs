use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(EntryId, "entry");
branded_id!(ForkId, "fork");
branded_id!(BranchId, "branch");
branded_id!(RecordId, "rec");
branded_id!(ImageId, "img");

impl BranchId {
    /// Parse a branch id arriving from an untrusted request field.
    /// Blank values mean "no branch".
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn entry_and_fork_ids_have_prefix() {
        assert!(EntryId::new().as_str().starts_with("entry_"));
        assert!(ForkId::new().as_str().starts_with("fork_"));
        assert!(BranchId::new().as_str().starts_with("branch_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = EntryId::new();
        let b = EntryId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ForkId::from_raw("fork_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""fork_1""#);
        let parsed: ForkId = serde_json::from_str(r#""fork_1""#).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn branch_parse_trims_and_rejects_blank() {
        assert_eq!(BranchId::parse("  branch_a "), Some(BranchId::from_raw("branch_a")));
        assert_eq!(BranchId::parse("   "), None);
        assert_eq!(BranchId::parse(""), None);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<EntryId> = (0..50).map(|_| EntryId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
