use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a throttled unit of work.
///
/// Any small copyable value with equality and hashing can key the
/// dispatcher; `SignalKey` is the one the rollup pipeline uses.
pub trait DispatchKey: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> DispatchKey for T where T: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Account that owns one or more projects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tracked project (one site or app sending events).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Composite `(user, project)` key for rollup signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub user_id: UserId,
    pub project_id: ProjectId,
}

impl SignalKey {
    pub const fn new(user_id: UserId, project_id: ProjectId) -> Self {
        Self {
            user_id,
            project_id,
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.project_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_signal_key_display() {
        let user = UserId(Uuid::from_u128(1));
        let project = ProjectId(Uuid::from_u128(2));
        let key = SignalKey::new(user, project);

        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000001:00000000-0000-0000-0000-000000000002"
        );
    }

    #[test]
    fn test_equal_composites_are_same_key() {
        let user = UserId::new_v4();
        let project = ProjectId::new_v4();

        let mut keys = HashSet::new();
        keys.insert(SignalKey::new(user, project));
        keys.insert(SignalKey::new(user, project));
        keys.insert(SignalKey::new(user, ProjectId::new_v4()));

        assert_eq!(keys.len(), 2);
    }
}
