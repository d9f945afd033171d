//! Network Layer
//!
//! WebSocket transport for sessions. Game logic never lives here; this
//! layer authenticates, checks ownership and moves messages between
//! clients and `game/`.

pub mod auth;
pub mod protocol;
pub mod dispatch;
pub mod peer;
pub mod session;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, authenticate_join, validate_token};
pub use protocol::{ClientMessage, ServerMessage, JoinRequest, SyncFrame, WelcomeInfo};
pub use dispatch::{DispatchError, Outbound, Recipient};
pub use peer::PeerReplica;
pub use session::{GameSession, SessionId, SessionState, SessionManager, SessionError};
pub use server::{GameServer, ServerConfig, GameServerError};
