//! The session gateway: a TCP listener that authenticates attach requests
//! and bridges client connections onto task pseudo-terminals.

pub mod protocol;
pub mod server;

pub use server::ProxyServer;
