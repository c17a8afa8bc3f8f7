//! # sftpd
//!
//! A minimal SSH server whose only job is to expose an SFTP subsystem.
//!
//! One connection is accepted per run by default. Its channels are
//! demultiplexed: anything but `session` is refused, and a session channel
//! that asks for the `sftp` subsystem is handed to the SFTP engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sftpd::{Server, ServerConfig, SftpEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sftpd::Error> {
//!     // Host key is read from ~/.ssh/id_rsa
//!     let config = ServerConfig::new().port(2222);
//!
//!     Server::new(SftpEngine::current_dir())
//!         .config(config)
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Authentication
//!
//! Every client is accepted unless a callback is installed:
//!
//! ```rust,no_run
//! use sftpd::{Server, ServerConfig, SftpEngine};
//!
//! # async fn example() -> Result<(), sftpd::Error> {
//! Server::new(SftpEngine::new("/srv/sftp"))
//!     .config(ServerConfig::new().with_key_file("/etc/sftpd/host_key"))
//!     .with_users(vec![("user".into(), "pass".into())])
//!     .run()
//!     .await
//! # }
//! ```

pub mod channel;
pub mod engine;
pub mod error;
pub mod handle;
pub mod keys;
pub mod orchestrator;
pub mod server;
pub mod sftp_handler;
pub mod ssh_handler;

// Re-exports for convenience
pub use channel::{ChannelOpen, ChannelRequest, GlobalRequest, OpenOutcome, RejectReason};
pub use engine::{SftpEngine, SubsystemEngine};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use server::{Server, ServerConfig};
pub use ssh_handler::{AuthConfig, NoneAuthCallback, PasswordAuthCallback, PubkeyAuthCallback};
