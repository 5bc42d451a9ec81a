//! Request identity and cache-scope types shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a live request: (session, execution) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub session_id: String,
    pub execution_id: u64,
}

impl RequestId {
    pub fn new(session_id: impl Into<String>, execution_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            execution_id,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.execution_id)
    }
}

/// The session a request runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_name: String,
    pub vdb_name: String,
    pub vdb_version: u32,
}

impl SessionInfo {
    pub fn new(
        session_id: impl Into<String>,
        user_name: impl Into<String>,
        vdb_name: impl Into<String>,
        vdb_version: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_name: user_name.into(),
            vdb_name: vdb_name.into(),
            vdb_version,
        }
    }
}

/// How widely a plan or result may be shared.
///
/// Ordered finest to coarsest: a `Session` deterministic result can only be
/// reused inside its session, a `Deterministic` one by anybody.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Never cacheable.
    #[default]
    Nondeterministic,
    /// Same answer within one session.
    Session,
    /// Same answer for one user across sessions.
    User,
    /// Same answer for everybody.
    Deterministic,
}

impl Determinism {
    pub fn is_cacheable(self) -> bool {
        self != Determinism::Nondeterministic
    }

    /// Whether a cache key at this level must keep the session id.
    pub fn keeps_session(self) -> bool {
        self <= Determinism::Session
    }

    /// Whether a cache key at this level must keep the user name.
    pub fn keeps_user(self) -> bool {
        self <= Determinism::User
    }
}
