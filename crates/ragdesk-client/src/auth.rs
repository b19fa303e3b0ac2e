//! Bearer-token context shared by every request

use std::fmt;
use std::sync::RwLock;

type UnauthorizedHandler = Box<dyn Fn() + Send + Sync>;

/// Holds the bearer token and the re-login hook.
///
/// The token is read on every request, so a `set_token` or `clear` from one
/// part of the program is picked up by the next request anywhere else.
#[derive(Default)]
pub struct AuthContext {
    token: RwLock<Option<String>>,
    on_unauthorized: Option<UnauthorizedHandler>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
            on_unauthorized: None,
        }
    }

    /// Register the callback run when the backend rejects the token
    pub fn with_unauthorized_handler(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_unauthorized = Some(Box::new(handler));
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Drop the token and ask for a fresh login
    pub fn handle_unauthorized(&self) {
        self.clear();
        if let Some(handler) = &self.on_unauthorized {
            handler();
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("authenticated", &self.is_authenticated())
            .field("has_unauthorized_handler", &self.on_unauthorized.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unauthorized_clears_token_and_notifies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let auth = AuthContext::with_token(Some("abc".to_string()))
            .with_unauthorized_handler(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert_eq!(auth.token().as_deref(), Some("abc"));
        auth.handle_unauthorized();

        assert!(!auth.is_authenticated());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_updates_are_visible_immediately() {
        let auth = AuthContext::new();
        assert_eq!(auth.token(), None);
        auth.set_token("fresh");
        assert_eq!(auth.token().as_deref(), Some("fresh"));
        auth.clear();
        assert_eq!(auth.token(), None);
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let auth = AuthContext::with_token(Some("secret-token".to_string()));
        assert!(!format!("{:?}", auth).contains("secret-token"));
    }
}
