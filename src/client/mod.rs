//! Client side: control-stream bootstrap and the single-connection client.

mod bootstrap;
#[allow(clippy::module_inception)]
mod client;

pub use bootstrap::resolve;
pub use client::*;
