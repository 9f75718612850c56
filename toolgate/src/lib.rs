//! The toolgate binary crate: CLI surface and the southbound stdio server
//! that exposes the gateway itself as a tool provider.

pub mod cli;
pub mod server;
