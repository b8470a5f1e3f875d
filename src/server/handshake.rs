//! Control-channel accept loop.
//!
//! Each accepted stream is given a connection id and the data socket's port, then left open as a
//! liveness signal. No application data ever flows over it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::transport::{
    is_ignorable, AcceptMessage, ConnectionPhase, ControlStream, Demultiplexer,
};

/// Accept control streams until `shutdown` fires.
///
/// Accept errors are logged and the loop continues.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    demux: Arc<Demultiplexer>,
    data_port: u16,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => accept_peer(&demux, stream, peer, data_port).await,
            Err(e) if is_ignorable(&e) => trace!("accept interrupted: {}", e),
            Err(e) => warn!("accept failed: {}", e),
        }
    }
    debug!("accept loop stopped");
}

async fn accept_peer(demux: &Demultiplexer, stream: TcpStream, peer: SocketAddr, data_port: u16) {
    let control = Arc::new(ControlStream::new(stream, peer));
    let id = match demux.register(peer, Some(Arc::clone(&control)), ConnectionPhase::Pending) {
        Ok(id) => id,
        Err(e) => {
            // Dropping the stream closes it; the client sees EOF before any accept message.
            warn!("refusing control stream from {}: {}", peer, e);
            return;
        }
    };

    // Connect is queued before the accept message leaves, so it precedes any data event.
    demux.mark_connected(id);
    let accept = AcceptMessage::new(id, data_port).encode();
    match control.write_all(&accept).await {
        Ok(()) => info!("connection {}: accepted {}", id, peer),
        Err(e) => {
            warn!("connection {}: accept message to {} failed: {}", id, peer, e);
            demux.begin_disconnect(id);
            demux.registry().remove(id);
        }
    }
}
