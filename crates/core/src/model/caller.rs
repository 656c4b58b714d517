use crate::model::UserId;

/// Resolved identity of the caller, produced by the external identity layer.
///
/// This subsystem never authenticates anyone itself; it only refuses to act
/// for `Anonymous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    User(UserId),
}

impl Caller {
    /// Returns the user id when the caller is authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Caller::User(id) => Some(*id),
            Caller::Anonymous => None,
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Caller::Anonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn user_id_round_trips() {
        let id = UserId::new(Uuid::from_u128(7));
        assert_eq!(Caller::User(id).user_id(), Some(id));
        assert_eq!(Caller::Anonymous.user_id(), None);
        assert!(Caller::Anonymous.is_anonymous());
    }
}
