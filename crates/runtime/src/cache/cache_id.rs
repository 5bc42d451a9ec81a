use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sluice_common::models::{Determinism, SessionInfo};
use sluice_common::types::Value;

/// Fingerprint of a statement in the context it ran in.
///
/// Fields cleared by [`CacheId::normalize`] are `None`, so derived equality
/// and hashing treat them as absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheId {
    pub sql: String,
    pub parse_options: String,
    pub vdb_name: String,
    pub vdb_version: u32,
    pub session_id: Option<String>,
    pub user_name: Option<String>,
    pub parameters: Option<Vec<String>>,
}

impl CacheId {
    pub fn new(sql: impl Into<String>, parse_options: impl Into<String>, session: &SessionInfo) -> Self {
        Self {
            sql: sql.into(),
            parse_options: parse_options.into(),
            vdb_name: session.vdb_name.clone(),
            vdb_version: session.vdb_version,
            session_id: Some(session.session_id.clone()),
            user_name: Some(session.user_name.clone()),
            parameters: None,
        }
    }

    /// Adds bind parameters as literal text. An empty list stays absent.
    pub fn with_parameters(mut self, parameters: &[Value]) -> Self {
        self.parameters = if parameters.is_empty() {
            None
        } else {
            Some(parameters.iter().map(Value::to_literal).collect())
        };
        self
    }

    /// Clears the identity fields `level` does not depend on.
    pub fn normalize(&self, level: Determinism) -> CacheId {
        let mut id = self.clone();
        if !level.keeps_session() {
            id.session_id = None;
        }
        if !level.keeps_user() {
            id.user_name = None;
        }
        id
    }

    pub fn without_session(&self) -> CacheId {
        CacheId {
            session_id: None,
            ..self.clone()
        }
    }

    pub fn without_session_and_user(&self) -> CacheId {
        CacheId {
            session_id: None,
            user_name: None,
            ..self.clone()
        }
    }

    /// Short stable digest for logs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        hasher.update([0]);
        hasher.update(self.parse_options.as_bytes());
        hasher.update([0]);
        hasher.update(self.vdb_name.as_bytes());
        hasher.update(self.vdb_version.to_le_bytes());
        for field in [&self.session_id, &self.user_name] {
            match field {
                Some(value) => {
                    hasher.update([1]);
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        if let Some(parameters) = &self.parameters {
            for parameter in parameters {
                hasher.update(parameter.as_bytes());
                hasher.update([0]);
            }
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(id: &CacheId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    fn level() -> impl Strategy<Value = Determinism> {
        prop_oneof![
            Just(Determinism::Nondeterministic),
            Just(Determinism::Session),
            Just(Determinism::User),
            Just(Determinism::Deterministic),
        ]
    }

    #[test]
    fn test_parameters_are_literals() {
        let session = SessionInfo::new("s1", "alice", "vdb", 1);
        let id = CacheId::new("SELECT ?", "", &session)
            .with_parameters(&[Value::Integer(7), Value::String("x".into())]);
        assert_eq!(id.parameters, Some(vec!["7".to_string(), "'x'".to_string()]));
        assert_eq!(
            CacheId::new("SELECT 1", "", &session).with_parameters(&[]).parameters,
            None
        );
    }

    #[test]
    fn test_user_level_keeps_user_only() {
        let session = SessionInfo::new("s1", "alice", "vdb", 1);
        let id = CacheId::new("SELECT 1", "", &session).normalize(Determinism::User);
        assert_eq!(id.session_id, None);
        assert_eq!(id.user_name.as_deref(), Some("alice"));
        assert_eq!(id.fingerprint().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(
            sql in "[a-z ]{1,20}",
            s1 in "[a-z]{1,6}",
            s2 in "[a-z]{1,6}",
            user in "[a-z]{1,6}",
            level in level(),
        ) {
            let a = CacheId::new(sql.clone(), "", &SessionInfo::new(s1, user.clone(), "vdb", 1));
            let once = a.normalize(level);
            prop_assert_eq!(once.normalize(level), once.clone());

            // Two ids differing only in a cleared field compare and hash equal
            let b = CacheId::new(sql, "", &SessionInfo::new(s2, user, "vdb", 1));
            if !level.keeps_session() {
                let other = b.normalize(level);
                prop_assert_eq!(&once, &other);
                prop_assert_eq!(hash_of(&once), hash_of(&other));
                prop_assert_eq!(once.fingerprint(), other.fingerprint());
            }
        }
    }
}
