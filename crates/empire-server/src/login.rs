//! HTTP login endpoint.
//!
//! Clients POST `{"cookie", "token"}` to `/login`; known cookies get the game
//! host and port plus their empire, unknown cookies get a 401 so the client
//! forgets them. Runs on its own thread, off the tokio runtime.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use empire_config::{Account, ServerSettings};
use empire_net::{LoginRequest, LoginResponse, LoginStatus};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::world::World;

#[derive(Debug, thiserror::Error)]
pub enum LoginServerError {
    #[error("failed to bind login endpoint to {addr}: {error}")]
    BindError { addr: SocketAddr, error: String },
}

/// Decides login outcomes from the configured accounts.
pub struct LoginService {
    accounts: Vec<Account>,
    world: Arc<World>,
    public_host: Option<String>,
    game_port: u16,
}

impl LoginService {
    pub fn new(settings: &ServerSettings, world: Arc<World>) -> Self {
        Self {
            accounts: settings.accounts.clone(),
            world,
            public_host: settings.public_host.clone(),
            game_port: settings.game_port,
        }
    }

    /// HTTP status and body for one login request.
    pub fn login(&self, request: &LoginRequest) -> (u16, Option<LoginResponse>) {
        let Some(account) = self.accounts.iter().find(|a| a.cookie == request.cookie) else {
            return (401, None);
        };

        let refused = |status| LoginResponse {
            status,
            host: None,
            port: None,
            empire: None,
        };
        if account.banned {
            tracing::info!("Refusing banned empire {}", account.empire_id);
            return (200, Some(refused(LoginStatus::AccountBanned)));
        }
        if let (Some(bound), Some(token)) = (&account.identity, &request.token)
            && bound != token
        {
            tracing::info!("Identity mismatch for empire {}", account.empire_id);
            return (200, Some(refused(LoginStatus::EmpireMismatch)));
        }

        let empire = self
            .world
            .empire(account.empire_id)
            .unwrap_or_else(|| account.empire());
        (
            200,
            Some(LoginResponse {
                status: LoginStatus::Success,
                host: self.public_host.clone(),
                port: Some(self.game_port),
                empire: Some(empire),
            }),
        )
    }
}

/// The login endpoint's HTTP listener.
pub struct LoginServer {
    server: Arc<Server>,
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl LoginServer {
    /// Bind `addr` and serve on a background thread.
    pub fn start(addr: SocketAddr, service: Arc<LoginService>) -> Result<Self, LoginServerError> {
        let server = Server::http(addr).map_err(|e| LoginServerError::BindError {
            addr,
            error: e.to_string(),
        })?;
        let server = Arc::new(server);
        let bound = server.server_addr().to_ip().unwrap_or(addr);

        let serving = Arc::clone(&server);
        let handle = thread::Builder::new()
            .name("login-http".to_string())
            .spawn(move || {
                for request in serving.incoming_requests() {
                    if let Err(e) = handle_request(request, &service) {
                        tracing::warn!("Login endpoint failed to respond: {e}");
                    }
                }
            })
            .map_err(|e| LoginServerError::BindError {
                addr,
                error: e.to_string(),
            })?;

        tracing::info!("Login endpoint listening on http://{bound}/login");
        Ok(Self {
            server,
            addr: bound,
            handle: Some(handle),
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Login endpoint thread panicked");
        }
    }
}

impl Drop for LoginServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_request(mut request: Request, service: &LoginService) -> std::io::Result<()> {
    if request.url() != "/login" {
        return request.respond(Response::empty(404));
    }
    if request.method() != &Method::Post {
        return request.respond(Response::empty(405));
    }

    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        tracing::debug!("Unreadable login body: {e}");
        return request.respond(Response::empty(400));
    }
    let login: LoginRequest = match serde_json::from_str(&body) {
        Ok(login) => login,
        Err(e) => {
            tracing::debug!("Malformed login body: {e}");
            return request.respond(Response::empty(400));
        }
    };

    let (status, reply) = service.login(&login);
    let Some(reply) = reply else {
        return request.respond(Response::empty(status));
    };
    let json = serde_json::to_string(&reply).map_err(std::io::Error::other)?;
    let mut response = Response::from_string(json).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response.add_header(header);
    }
    request.respond(response)
}
