//! Test gateway client.
//!
//! Speaks newline-delimited JSON messages to a gateway and asserts on the
//! replies and pushes it receives.

use imgate_proto::{DeviceId, Message, Uid};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

/// A test client.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_seq: u64,
}

#[allow(dead_code)]
impl TestClient {
    /// Connect to a gateway.
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_seq: 1,
        })
    }

    /// Send a raw line.
    pub async fn send_raw(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a message as one line.
    pub async fn send(&mut self, msg: &Message) -> anyhow::Result<()> {
        let line = serde_json::to_string(msg)?;
        self.send_raw(&line).await
    }

    /// Receive a single message.
    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    /// Receive a message with a timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<Message> {
        let mut line = String::new();
        let n = timeout(dur, self.reader.read_line(&mut line)).await??;
        if n == 0 {
            anyhow::bail!("connection closed");
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Receive messages until `predicate` matches, returning the match.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        loop {
            let msg = self.recv().await?;
            if predicate(&msg) {
                return Ok(msg);
            }
        }
    }

    /// Wait for the next message carrying `action`.
    pub async fn recv_action(&mut self, action: &str) -> anyhow::Result<Message> {
        self.recv_until(|m| m.action == action).await
    }

    /// Whether nothing arrives within `dur`.
    pub async fn is_quiet(&mut self, dur: Duration) -> bool {
        self.recv_timeout(dur).await.is_err()
    }

    /// Send `action` with `data` and wait for its reply.
    pub async fn request(&mut self, action: &str, data: Value) -> anyhow::Result<Message> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send(&Message::new(action, data).with_seq(seq)).await?;
        let action = action.to_string();
        self.recv_until(|m| m.seq == seq && m.action == action).await
    }

    /// Sign in as `(uid, device)` through a trusting auth backend.
    pub async fn sign_in(&mut self, uid: Uid, device: DeviceId) -> anyhow::Result<()> {
        let reply = self
            .request("session.signin", json!({ "uid": uid, "device": device }))
            .await?;
        if reply.data.get("error").is_some() {
            anyhow::bail!("sign in refused: {}", reply.data);
        }
        Ok(())
    }
}
