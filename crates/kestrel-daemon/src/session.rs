use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec;
use crate::dispatch::{ConnectionInfo, Dispatcher};
use crate::error::ProtocolError;
use crate::protocol::Reply;

/// Serve one client: requests are handled strictly in order, one reply per
/// request, until the peer closes or the stream breaks.
pub async fn serve(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    io_timeout: Duration,
) -> Result<(), ProtocolError> {
    let conn = ConnectionInfo {
        peer: stream.peer_addr()?,
        local: stream.local_addr()?,
    };
    info!(peer = %conn.peer, "Client connected");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut handled = 0usize;

    let result = loop {
        let request = match codec::read_request(&mut reader, io_timeout).await {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(ProtocolError::Malformed(e)) => {
                // The frame was consumed, but a client sending garbage is not
                // trusted with further requests.
                let reply = Reply::error(format!("malformed request: {e}"));
                if let Err(e) = codec::write_reply(&mut writer, &reply, io_timeout).await {
                    debug!(peer = %conn.peer, error = %e, "Could not report malformed request");
                }
                break Err(ProtocolError::Malformed(e));
            }
            Err(e) => break Err(e),
        };

        let reply = dispatcher.dispatch(request, conn).await;
        if let Err(e) = codec::write_reply(&mut writer, &reply, io_timeout).await {
            break Err(e);
        }
        handled += 1;
    };

    match &result {
        Ok(()) => info!(peer = %conn.peer, requests = handled, "Client disconnected"),
        Err(e) => warn!(peer = %conn.peer, requests = handled, error = %e, "Session ended"),
    }
    result
}
