//! Hatchway is a small, portable SSH server. It serves interactive shells on
//! ptys, command execution, the sftp subsystem, and local and remote TCP/Unix
//! socket forwarding, each of which can be switched off individually.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Permissions;

pub mod config;

mod bridge;
mod entrypoint;
mod error;
mod sftp;
mod ssh;

pub use crate::{config::ApplicationConfig, entrypoint::entrypoint};

// Data shared by every SSH connection. Immutable once the server is running.
pub(crate) struct HatchwayServer {
    // Operations connections are allowed to perform.
    pub(crate) permissions: Permissions,
    // Shell spawned when a client requests a pty.
    pub(crate) shell: String,
    // Credentials allowed to log in, keyed by username.
    pub(crate) users: HashMap<String, String>,
}

// Newtype around the shared server data so that `russh::server::Server` (a
// foreign trait) can be implemented for it; the orphan rules forbid
// implementing a foreign trait directly on `Arc<HatchwayServer>`.
pub(crate) struct HatchwayServerHandle(pub(crate) Arc<HatchwayServer>);
