//! Client bootstrap over the control stream.
//!
//! Reads the server's accept message, binds the client to the assigned connection id, and keeps
//! watching the stream: a Disconnect tag or EOF means the server went away.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::constants::ACCEPT_MESSAGE_SIZE;
use crate::core::{TransportError, TransportResult};
use crate::transport::{
    AcceptMessage, ControlStream, Demultiplexer, FrameType, TransportEvent,
};

/// Resolve `host` and pick the first IPv4 address, falling back to the first IPv6 one.
pub async fn resolve(host: &str, port: u16) -> TransportResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Resolve(format!("{host}: no addresses")))
}

/// What the control reader should do after decoding buffered bytes.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Read,
    Stop,
}

/// Watch the control stream until it closes or `shutdown` fires.
pub(crate) async fn run_control(
    control: ControlStream,
    demux: Arc<Demultiplexer>,
    shutdown: CancellationToken,
) {
    let server = control.peer();
    let mut buf = BytesMut::with_capacity(64);
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = control.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!("control stream closed by {}", server);
                server_gone(&demux, server, &io::ErrorKind::ConnectionAborted.into());
                return;
            }
            Ok(_) => {
                if decode_messages(&mut buf, &demux, server.ip()) == Next::Stop {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("control stream to {} failed: {}", server, e);
                server_gone(&demux, server, &e);
                return;
            }
        }
    }
}

fn decode_messages(buf: &mut BytesMut, demux: &Demultiplexer, server_ip: IpAddr) -> Next {
    while let Some(&tag) = buf.first() {
        match FrameType::from_byte(tag) {
            Some(FrameType::Connect) => {
                if buf.len() < ACCEPT_MESSAGE_SIZE {
                    break;
                }
                let message = buf.split_to(ACCEPT_MESSAGE_SIZE);
                match AcceptMessage::decode_body(&message[1..]) {
                    Ok(accept) => match demux.bind_client(accept, server_ip) {
                        // The server only knows our control address; show it the data one.
                        Ok(true) => {
                            if let Err(e) = demux.announce(accept.connection_id) {
                                warn!("connection {}: announce failed: {}", accept.connection_id, e);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!("cannot bind to connection {}: {}", accept.connection_id, e),
                    },
                    Err(e) => warn!("malformed accept message: {}", e),
                }
            }
            Some(FrameType::Disconnect) => {
                buf.advance(1);
                info!("server requested disconnect");
                server_gone(
                    demux,
                    SocketAddr::new(server_ip, 0),
                    &io::ErrorKind::ConnectionAborted.into(),
                );
                return Next::Stop;
            }
            Some(FrameType::Data) | None => {
                debug!("unexpected control byte 0x{:02x}, discarding {} bytes", tag, buf.len());
                buf.clear();
            }
        }
    }
    Next::Read
}

/// Bound clients get their one Disconnect event; unbound ones an error.
fn server_gone(demux: &Demultiplexer, server: SocketAddr, cause: &io::Error) {
    match demux.client_binding() {
        Some(id) => {
            demux.begin_disconnect(id);
        }
        None => demux
            .events()
            .enqueue(TransportEvent::error(Some(server), cause)),
    }
}
