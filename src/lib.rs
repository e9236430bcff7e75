//! Client SDK for Sprites remote sandboxes
//!
//! A sprite is a remote sandbox you can run shell commands and interactive
//! sessions in. This crate wraps the Sprites API: sprite CRUD over HTTP,
//! checkpoints, network policies, and streaming command execution over
//! WebSockets.
//!
//! Plain commands multiplex over a bounded pool of control connections, so
//! running many sequential commands does not open a connection per command:
//!
//! ```no_run
//! use sprites::SpritesClient;
//!
//! # async fn run() -> sprites::Result<()> {
//! let client = SpritesClient::new("token");
//! let sprite = client.create("dev").await?;
//!
//! let output = sprite.command("echo").arg("hello").output().await?;
//! assert_eq!(output.stdout_str(), "hello\n");
//!
//! sprite.destroy().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Interactive and detachable sessions ([`Sprite::exec`], [`Sprite::attach`])
//! each get a dedicated WebSocket with TTY support instead.

pub mod client;
pub mod command;
pub mod error;
pub mod frame;
pub mod mux;
pub mod pool;
pub mod protocol;
pub mod sprite;

pub use client::{SpriteConfig, SpriteInfo, SpritesClient, DEFAULT_API_URL};
pub use command::{SessionEvent, WsCommand};
pub use error::{Result, SpriteError};
pub use frame::StreamTag;
pub use mux::{ControlConnection, ControlEndpoint, OpConn};
pub use pool::{ConnectionPool, PoolConfig};
pub use protocol::SessionOptions;
pub use sprite::{
    Checkpoint, Child, Command, NetworkPolicy, NetworkPolicyRule, Output, PolicyAction, Sprite,
};
