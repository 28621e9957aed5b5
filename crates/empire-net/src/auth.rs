//! Login handshake against the HTTP login endpoint.
//!
//! The client POSTs its cookie (and an identity token, if the player is
//! signed in) and gets back the game host and port plus its empire. All of
//! this is blocking I/O; the reconnect controller runs it on tokio's
//! blocking pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::Empire;

/// Outcome reported by the login server in a 200 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginStatus {
    /// Logged in; host and port are valid.
    Success,
    /// The account exists but may not play.
    AccountBanned,
    /// The identity token belongs to a different empire than the cookie.
    EmpireMismatch,
    /// The server could not say why.
    UnknownError,
}

/// Body of the login POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Session cookie identifying the empire.
    pub cookie: String,
    /// Identity token, `None` for anonymous empires.
    pub token: Option<String>,
}

/// Body of a 200 login response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: LoginStatus,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub empire: Option<Empire>,
}

/// Raw HTTP result of a login POST.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body. Only present for 200 responses.
    pub body: Option<LoginResponse>,
}

/// Where to open the game socket, and who we are once it is open.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginGrant {
    pub host: String,
    pub port: u16,
    pub empire: Empire,
    pub status: LoginStatus,
}

/// Errors produced by the login handshake.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server answered 200 but refused the login. Not retried.
    #[error("login rejected: {0:?}")]
    Rejected(LoginStatus),

    /// The server rejected the cookie itself (4xx). Retried without it.
    #[error("credential rejected by login server (HTTP {status})")]
    CredentialInvalid { status: u16 },

    /// Any other non-200 status.
    #[error("login server returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// The request never got an HTTP answer.
    #[error("login request failed: {0}")]
    Transport(String),

    /// A 200 response we could not use.
    #[error("malformed login response: {0}")]
    MalformedResponse(String),

    /// The identity provider could not produce a token.
    #[error("identity token unavailable: {0}")]
    Identity(String),
}

impl AuthError {
    /// Whether a later retry may succeed without anything changing.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AuthError::Rejected(_))
    }
}

/// Source of the player's identity token.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Fresh token, or `None` when playing anonymously.
    fn identity_token(&self) -> Result<Option<String>, AuthError>;
}

/// Identity provider for players that never signed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl IdentityProvider for Anonymous {
    fn identity_token(&self) -> Result<Option<String>, AuthError> {
        Ok(None)
    }
}

/// Performs the login POST.
pub trait LoginTransport: Send + Sync + 'static {
    /// POST `request` to `url`. Non-200 statuses are a reply, not an error.
    fn post_login(&self, url: &str, request: &LoginRequest) -> Result<HttpReply, AuthError>;
}

/// [`LoginTransport`] over `ureq`, with JSON bodies.
pub struct UreqLoginTransport {
    agent: ureq::Agent,
}

impl UreqLoginTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl Default for UreqLoginTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl LoginTransport for UreqLoginTransport {
    fn post_login(&self, url: &str, request: &LoginRequest) -> Result<HttpReply, AuthError> {
        match self.agent.post(url).send_json(request) {
            Ok(resp) => {
                let status = resp.status();
                if status != 200 {
                    return Ok(HttpReply { status, body: None });
                }
                let body: LoginResponse = resp
                    .into_json()
                    .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
                Ok(HttpReply {
                    status,
                    body: Some(body),
                })
            }
            Err(ureq::Error::Status(status, _)) => Ok(HttpReply { status, body: None }),
            Err(ureq::Error::Transport(e)) => Err(AuthError::Transport(e.to_string())),
        }
    }
}

/// Runs the login exchange and applies the status policy.
pub struct AuthHandshake {
    transport: Arc<dyn LoginTransport>,
    identity: Arc<dyn IdentityProvider>,
    default_host: String,
}

impl AuthHandshake {
    /// `default_host` is used when the login response names no host.
    pub fn new(
        transport: Arc<dyn LoginTransport>,
        identity: Arc<dyn IdentityProvider>,
        default_host: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            identity,
            default_host: default_host.into(),
        }
    }

    /// Log in with `cookie` at `url`. Blocking.
    pub fn login(&self, url: &str, cookie: &str) -> Result<LoginGrant, AuthError> {
        let token = self.identity.identity_token()?;
        if token.is_none() {
            tracing::debug!("Anonymous login, no identity token");
        }

        tracing::info!("Logging in: {url}");
        let reply = self.transport.post_login(
            url,
            &LoginRequest {
                cookie: cookie.to_string(),
                token,
            },
        )?;

        if reply.status != 200 {
            if (401..500).contains(&reply.status) {
                return Err(AuthError::CredentialInvalid {
                    status: reply.status,
                });
            }
            return Err(AuthError::HttpStatus {
                status: reply.status,
            });
        }

        let response = reply
            .body
            .ok_or_else(|| AuthError::MalformedResponse("empty body".to_string()))?;
        if response.status != LoginStatus::Success {
            return Err(AuthError::Rejected(response.status));
        }

        let port = response
            .port
            .ok_or_else(|| AuthError::MalformedResponse("missing port".to_string()))?;
        let empire = response
            .empire
            .ok_or_else(|| AuthError::MalformedResponse("missing empire".to_string()))?;
        let host = response
            .host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.default_host.clone());

        Ok(LoginGrant {
            host,
            port,
            empire,
            status: response.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Read;
    use std::thread;

    struct Scripted {
        reply: Mutex<Option<Result<HttpReply, AuthError>>>,
        seen: Mutex<Vec<LoginRequest>>,
    }

    impl Scripted {
        fn new(reply: Result<HttpReply, AuthError>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl LoginTransport for Scripted {
        fn post_login(&self, _url: &str, request: &LoginRequest) -> Result<HttpReply, AuthError> {
            self.seen.lock().push(request.clone());
            self.reply
                .lock()
                .take()
                .unwrap_or(Err(AuthError::Transport("no reply scripted".to_string())))
        }
    }

    struct Signed;

    impl IdentityProvider for Signed {
        fn identity_token(&self) -> Result<Option<String>, AuthError> {
            Ok(Some("tok".to_string()))
        }
    }

    fn empire() -> Empire {
        Empire {
            id: 42,
            display_name: "Vega Concord".to_string(),
            home_star: None,
        }
    }

    fn ok(host: Option<&str>, port: Option<u16>) -> Result<HttpReply, AuthError> {
        Ok(HttpReply {
            status: 200,
            body: Some(LoginResponse {
                status: LoginStatus::Success,
                host: host.map(str::to_string),
                port,
                empire: Some(empire()),
            }),
        })
    }

    fn handshake(transport: Arc<Scripted>) -> AuthHandshake {
        AuthHandshake::new(transport, Arc::new(Anonymous), "game.example")
    }

    #[test]
    fn test_success_returns_grant() {
        let transport = Scripted::new(ok(Some("10.0.0.5"), Some(8081)));
        let grant = handshake(transport.clone()).login("http://login", "c00kie").unwrap();

        assert_eq!(grant.host, "10.0.0.5");
        assert_eq!(grant.port, 8081);
        assert_eq!(grant.empire.id, 42);
        assert_eq!(
            transport.seen.lock()[0],
            LoginRequest {
                cookie: "c00kie".to_string(),
                token: None
            }
        );
    }

    #[test]
    fn test_missing_host_falls_back_to_default() {
        let grant = handshake(Scripted::new(ok(None, Some(8081))))
            .login("http://login", "c")
            .unwrap();
        assert_eq!(grant.host, "game.example");
    }

    #[test]
    fn test_missing_port_is_malformed() {
        let err = handshake(Scripted::new(ok(None, None)))
            .login("http://login", "c")
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_4xx_is_credential_invalid() {
        for status in [401, 403, 404, 499] {
            let err = handshake(Scripted::new(Ok(HttpReply { status, body: None })))
                .login("http://login", "c")
                .unwrap_err();
            assert!(
                matches!(err, AuthError::CredentialInvalid { status: s } if s == status),
                "status {status} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_other_statuses_are_transient() {
        for status in [400, 500, 502, 503] {
            let err = handshake(Scripted::new(Ok(HttpReply { status, body: None })))
                .login("http://login", "c")
                .unwrap_err();
            assert!(matches!(err, AuthError::HttpStatus { .. }), "status {status}");
            assert!(err.is_transient());
        }
    }

    #[test]
    fn test_non_success_status_is_rejected() {
        let transport = Scripted::new(Ok(HttpReply {
            status: 200,
            body: Some(LoginResponse {
                status: LoginStatus::AccountBanned,
                host: None,
                port: None,
                empire: None,
            }),
        }));
        let err = handshake(transport).login("http://login", "c").unwrap_err();
        assert!(matches!(err, AuthError::Rejected(LoginStatus::AccountBanned)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_identity_token_is_sent() {
        let transport = Scripted::new(ok(None, Some(1)));
        AuthHandshake::new(transport.clone(), Arc::new(Signed), "h")
            .login("http://login", "c")
            .unwrap();
        assert_eq!(transport.seen.lock()[0].token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_login_status_wire_names() {
        let json = serde_json::to_string(&LoginStatus::EmpireMismatch).unwrap();
        assert_eq!(json, "\"EMPIRE_MISMATCH\"");
    }

    fn serve_once(status: u16, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let mut received = String::new();
            request.as_reader().read_to_string(&mut received).unwrap();
            request
                .respond(tiny_http::Response::from_string(body).with_status_code(status))
                .unwrap();
            received
        });
        (format!("http://127.0.0.1:{port}/login"), handle)
    }

    #[test]
    fn test_ureq_transport_posts_json() {
        let (url, server) = serve_once(
            200,
            r#"{"status":"SUCCESS","port":9000,"empire":{"id":7,"display_name":"Ares","home_star":null}}"#,
        );
        let reply = UreqLoginTransport::default()
            .post_login(
                &url,
                &LoginRequest {
                    cookie: "abc".to_string(),
                    token: None,
                },
            )
            .unwrap();

        assert_eq!(reply.status, 200);
        let body = reply.body.unwrap();
        assert_eq!(body.port, Some(9000));
        assert_eq!(body.empire.unwrap().display_name, "Ares");

        let sent: serde_json::Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent["cookie"], "abc");
        assert!(sent["token"].is_null());
    }

    #[test]
    fn test_ureq_transport_reports_error_status() {
        let (url, server) = serve_once(403, "no");
        let reply = UreqLoginTransport::default()
            .post_login(
                &url,
                &LoginRequest {
                    cookie: "abc".to_string(),
                    token: None,
                },
            )
            .unwrap();
        assert_eq!(reply, HttpReply { status: 403, body: None });
        server.join().unwrap();
    }

    #[test]
    fn test_ureq_transport_unreachable_is_transport_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = UreqLoginTransport::new(Duration::from_secs(2))
            .post_login(
                &format!("http://127.0.0.1:{port}/login"),
                &LoginRequest {
                    cookie: "abc".to_string(),
                    token: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }
}
