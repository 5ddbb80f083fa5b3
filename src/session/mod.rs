use std::sync::Arc;
use tokio::sync::watch;

/// Opaque authenticated-session credential. The core never inspects it; it is
/// presented verbatim at channel handshake time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Subscription side of the session boundary. `None` means logged out.
pub type SessionWatch = watch::Receiver<Option<SessionToken>>;

/// Publisher side of the session boundary. The channel client is the only
/// intended subscriber; consumers of the store never see this.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Arc<watch::Sender<Option<SessionToken>>>,
}

impl SessionHandle {
    pub fn new() -> (Self, SessionWatch) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Publish a new token. Republishing the token that is already current is
    /// suppressed so unrelated session updates never trigger a reconnect.
    /// Returns whether subscribers were woken.
    pub fn login(&self, token: SessionToken) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&token) {
                false
            } else {
                *current = Some(token.clone());
                true
            }
        })
    }

    /// Transition to logged-out. A no-op when already logged out.
    pub fn logout(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                false
            } else {
                *current = None;
                true
            }
        })
    }

    pub fn current_token(&self) -> Option<SessionToken> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_publishes_token_to_subscribers() {
        let (handle, rx) = SessionHandle::new();
        assert!(rx.borrow().is_none());
        assert!(handle.login(SessionToken::new("t1")));
        assert_eq!(
            rx.borrow().as_ref().map(SessionToken::as_str),
            Some("t1")
        );
        assert_eq!(
            handle.current_token().as_ref().map(SessionToken::as_str),
            Some("t1")
        );
    }

    #[test]
    fn republishing_the_current_token_does_not_wake_subscribers() {
        let (handle, mut rx) = SessionHandle::new();
        handle.login(SessionToken::new("t1"));
        rx.mark_unchanged();
        assert!(!handle.login(SessionToken::new("t1")));
        assert!(!rx.has_changed().unwrap_or(true));

        // A genuinely different token does wake them.
        assert!(handle.login(SessionToken::new("t2")));
        assert!(rx.has_changed().unwrap_or(false));
    }

    #[test]
    fn logout_transitions_to_none_once() {
        let (handle, rx) = SessionHandle::new();
        handle.login(SessionToken::new("t1"));
        assert!(handle.logout());
        assert!(rx.borrow().is_none());
        assert!(!handle.logout());
        assert!(handle.current_token().is_none());
    }
}
