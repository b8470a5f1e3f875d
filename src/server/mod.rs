//! Server side: control-channel accept loop and the multiplexing server.

mod handshake;
#[allow(clippy::module_inception)]
mod server;

pub use server::*;
