//! Client/server session layer for the empire game: packet framing, live
//! sessions, login handshake, automatic reconnection and packet dispatch.

pub mod auth;
pub mod backoff;
pub mod codec;
pub mod connector;
pub mod controller;
pub mod credentials;
pub mod dispatch;
pub mod packet;
pub mod queue;
pub mod server;
pub mod session;
pub mod state;

pub use auth::{
    Anonymous, AuthError, AuthHandshake, HttpReply, IdentityProvider, LoginGrant, LoginRequest,
    LoginResponse, LoginStatus, LoginTransport, UreqLoginTransport,
};
pub use backoff::{Backoff, ReconnectConfig};
pub use codec::{
    EncodeError, FrameConfig, FrameError, MalformedPacket, UpgradeError, decode, decode_payload,
    encode, encode_limited, encode_payload, read_frame, read_upgrade, write_frame, write_upgrade,
};
pub use connector::{ConnectError, Connector, ConnectFuture, SocketConfig, TcpConnector};
pub use controller::{ControllerBuilder, Delivery, NoResume, ReconnectController, ResumeSource};
pub use credentials::{CredentialStore, MemoryCredentials};
pub use dispatch::{Direction, Dispatcher, HandlerError, HandlerId, PacketEvent};
pub use packet::*;
pub use queue::OutboundQueue;
pub use server::{
    AccountResolver, GameServer, GameSession, PlayerHandler, ServerConfig, SessionIdentity,
    SessionRegistry, StaticAccounts,
};
pub use session::{
    BoxedTransport, ConnectionSession, IdGenerator, InboundHandler, InboundStream, SessionError,
    SessionId, SessionWriter, Transport,
};
pub use state::{ConnectionState, ConnectionStateWatch, ServerStateEvent};
