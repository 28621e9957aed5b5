//! Where the client keeps its session cookie and login endpoint.

use parking_lot::RwLock;

/// Persistent client credentials.
///
/// The controller reads the cookie before every attempt and clears it when
/// the login server says it is no longer valid. Implementations must be
/// cheap; they are called with no locks held but on the runtime threads.
pub trait CredentialStore: Send + Sync + 'static {
    /// Current cookie, if the player has one.
    fn cookie(&self) -> Option<String>;

    /// Replace the cookie.
    fn set_cookie(&self, cookie: String);

    /// Forget the cookie.
    fn clear_cookie(&self);

    /// Login endpoint URL.
    fn login_url(&self) -> String;

    /// Replace the login endpoint URL.
    fn set_login_url(&self, url: String);
}

#[derive(Debug, Default)]
struct Stored {
    cookie: Option<String>,
    login_url: String,
}

/// In-memory [`CredentialStore`].
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    inner: RwLock<Stored>,
}

impl MemoryCredentials {
    /// Store pointing at `login_url`, with an optional cookie.
    pub fn new(login_url: impl Into<String>, cookie: Option<String>) -> Self {
        Self {
            inner: RwLock::new(Stored {
                cookie,
                login_url: login_url.into(),
            }),
        }
    }
}

impl CredentialStore for MemoryCredentials {
    fn cookie(&self) -> Option<String> {
        self.inner.read().cookie.clone()
    }

    fn set_cookie(&self, cookie: String) {
        self.inner.write().cookie = Some(cookie);
    }

    fn clear_cookie(&self) {
        self.inner.write().cookie = None;
    }

    fn login_url(&self) -> String {
        self.inner.read().login_url.clone()
    }

    fn set_login_url(&self, url: String) {
        self.inner.write().login_url = url;
    }
}
