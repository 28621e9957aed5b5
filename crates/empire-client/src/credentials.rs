//! Credentials persisted in the client's `config.ron`.

use std::path::PathBuf;

use empire_config::Config;
use empire_net::CredentialStore;
use parking_lot::Mutex;

/// [`CredentialStore`] that writes every change back to the config file, so
/// a cookie the login server rejected stays forgotten across restarts.
pub struct ConfigCredentials {
    dir: PathBuf,
    config: Mutex<Config>,
}

impl ConfigCredentials {
    pub fn new(dir: PathBuf, config: Config) -> Self {
        Self {
            dir,
            config: Mutex::new(config),
        }
    }

    fn update(&self, change: impl FnOnce(&mut Config)) {
        let mut config = self.config.lock();
        change(&mut config);
        if let Err(e) = config.save(&self.dir) {
            tracing::warn!("Failed to persist credentials to {}: {e}", self.dir.display());
        }
    }
}

impl CredentialStore for ConfigCredentials {
    fn cookie(&self) -> Option<String> {
        self.config.lock().session.cookie.clone()
    }

    fn set_cookie(&self, cookie: String) {
        self.update(|config| config.session.cookie = Some(cookie));
    }

    fn clear_cookie(&self) {
        self.update(|config| config.session.cookie = None);
    }

    fn login_url(&self) -> String {
        self.config.lock().network.login_url.clone()
    }

    fn set_login_url(&self, url: String) {
        self.update(|config| config.network.login_url = url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_are_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigCredentials::new(dir.path().to_path_buf(), Config::default());

        store.set_cookie("fresh".to_string());
        store.set_login_url("http://other.test/login".to_string());
        let saved = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(saved.session.cookie.as_deref(), Some("fresh"));
        assert_eq!(saved.network.login_url, "http://other.test/login");

        store.clear_cookie();
        assert_eq!(store.cookie(), None);
        let saved = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(saved.session.cookie, None);
    }
}
