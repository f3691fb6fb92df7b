use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Authenticated end user as seen by the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub id: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            id: id.into(),
        }
    }

    /// An identity can author messages only with both a name and an id.
    pub fn is_complete(&self) -> bool {
        !self.display_name.trim().is_empty() && !self.id.trim().is_empty()
    }
}

/// Source of the current user; `None` until sign-in completes.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;
}

/// Swappable identity holder shared between the auth flow and chat views.
#[derive(Default)]
pub struct SessionIdentity {
    current: ArcSwapOption<Identity>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(identity: Identity) -> Self {
        let session = Self::new();
        session.sign_in(identity);
        session
    }

    pub fn sign_in(&self, identity: Identity) {
        tracing::info!("signed in as '{}' ({})", identity.display_name, identity.id);
        self.current.store(Some(Arc::new(identity)));
    }

    pub fn sign_out(&self) {
        if self.current.swap(None).is_some() {
            tracing::info!("signed out");
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.current.load_full().map(|identity| identity.as_ref().clone())
    }
}

impl IdentityProvider for Identity {
    fn current_identity(&self) -> Option<Identity> {
        Some(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_identity_tracks_sign_in_and_out() {
        let session = SessionIdentity::new();
        assert_eq!(session.current_identity(), None);

        session.sign_in(Identity::new("Alice", "u1"));
        assert_eq!(session.current_identity(), Some(Identity::new("Alice", "u1")));

        session.sign_in(Identity::new("Alice B.", "u1"));
        assert_eq!(
            session.current_identity().map(|identity| identity.display_name),
            Some("Alice B.".to_string())
        );

        session.sign_out();
        assert_eq!(session.current_identity(), None);
        session.sign_out();
    }

    #[test]
    fn blank_name_or_id_is_incomplete() {
        assert!(Identity::new("Alice", "u1").is_complete());
        assert!(!Identity::new("", "u1").is_complete());
        assert!(!Identity::new("Alice", "  ").is_complete());
        assert!(!Identity::new("", "").is_complete());
    }
}
