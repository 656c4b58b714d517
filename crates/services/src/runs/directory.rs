use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use runs_core::model::{SessionId, UserId};
use storage::repository::StorageError;

/// External session-definition lookup.
///
/// Session definitions live outside this subsystem; the lifecycle service
/// only asks whether one exists and whether the given user may work
/// through it. A negative answer surfaces to callers as `InvalidSession`.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Returns true when the session exists and the user may access it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` when the lookup itself fails.
    async fn can_access(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<bool, StorageError>;
}

/// Fixed in-memory directory for testing and prototyping.
///
/// Every registered session is accessible to every user; tests that need an
/// inaccessible session simply leave it unregistered.
#[derive(Clone, Default)]
pub struct StaticSessionDirectory {
    sessions: Arc<Mutex<HashSet<SessionId>>>,
}

impl StaticSessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session id as existing and accessible.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert(&self, session_id: SessionId) {
        self.sessions
            .lock()
            .expect("session set lock poisoned")
            .insert(session_id);
    }
}

#[async_trait]
impl SessionDirectory for StaticSessionDirectory {
    async fn can_access(
        &self,
        session_id: SessionId,
        _user_id: UserId,
    ) -> Result<bool, StorageError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(sessions.contains(&session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn unregistered_sessions_are_inaccessible() {
        let directory = StaticSessionDirectory::new();
        let known = SessionId::new(Uuid::from_u128(1));
        let unknown = SessionId::new(Uuid::from_u128(2));
        let user = UserId::new(Uuid::from_u128(3));

        directory.insert(known);

        assert!(directory.can_access(known, user).await.unwrap());
        assert!(!directory.can_access(unknown, user).await.unwrap());
    }
}
