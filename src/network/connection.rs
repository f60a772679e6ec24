//! One client connection: a reader task and a writer task.
//!
//! The writer drains the connection's bounded outbound channel, so a slow
//! peer stalls only its own writer. Replies to the client's own requests go
//! through the same channel and keep their order relative to pushes.

use futures_util::{SinkExt, StreamExt};
use imgate_proto::{JsonCodec, Message};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gateway::GatewaySettings;
use crate::state::{ConnectionRegistry, NewConnection, Transport};

/// Register a freshly accepted socket.
pub(super) fn accept(registry: &ConnectionRegistry, peer: SocketAddr) -> NewConnection {
    registry.client_connected(Transport::new(Some(peer)))
}

/// Run the connection to completion.
pub(super) async fn serve(
    stream: TcpStream,
    new: NewConnection,
    registry: Arc<ConnectionRegistry>,
    settings: GatewaySettings,
    server_shutdown: CancellationToken,
) {
    let NewConnection {
        connection,
        outbound: mut rx,
        ..
    } = new;
    let conn_token = connection.shutdown_token().clone();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        JsonCodec::<Message>::with_max_len(settings.max_frame_bytes),
    );
    let mut writer = FramedWrite::new(
        write_half,
        JsonCodec::<Arc<Message>>::with_max_len(settings.max_frame_bytes),
    );

    let writer_token = conn_token.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = writer_token.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some(msg) = next else { break };
            if let Err(e) = writer.send(msg).await {
                debug!(error = %e, "client write failed");
                break;
            }
        }
        writer_token.cancel();
    });

    loop {
        let frame = tokio::select! {
            _ = conn_token.cancelled() => break,
            _ = server_shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(error = %e, "client frame rejected, closing");
                break;
            }
            None => break,
        };

        let (uid, device) = connection.binding();
        let request = Message::new(msg.action.clone(), Value::Null).with_seq(msg.seq);
        let reply = match registry.handle_message(uid, device, msg).await {
            Ok(reply) => reply,
            Err(e) => Some(e.to_reply(&request)),
        };
        if let Some(reply) = reply {
            connection.outbound().push(Arc::new(reply));
        }
    }

    conn_token.cancel();
    registry.client_closed(&connection);
    let _ = writer_task.await;
    debug!("connection finished");
}
