use std::sync::RwLock;

/// Authenticated-user collaborator. Authentication itself lives in the host app.
pub trait UserSession: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

/// Session whose user is set directly by the host.
#[derive(Debug, Default)]
pub struct StaticSession {
    user: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        if let Ok(mut user) = self.user.write() {
            *user = Some(user_id.into());
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut user) = self.user.write() {
            *user = None;
        }
    }
}

impl UserSession for StaticSession {
    fn user_id(&self) -> Option<String> {
        self.user.read().ok().and_then(|u| u.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let session = StaticSession::signed_out();
        assert_eq!(session.user_id(), None);
        session.sign_in("runner-1");
        assert_eq!(session.user_id().as_deref(), Some("runner-1"));
        session.sign_out();
        assert_eq!(session.user_id(), None);
    }
}
