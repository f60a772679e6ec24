//! Test node management.
//!
//! Starts imgate nodes in-process from a TOML config written to a
//! temporary directory.

use imgate::{Config, Node};
use std::net::SocketAddr;
use tempfile::TempDir;

/// Auth-capable echo backend named `api`.
#[allow(dead_code)]
pub const ECHO_BACKEND: &str = r#"
[[backends]]
name = "api"
handler = "echo"
"#;

/// A running test node.
pub struct TestNode {
    node: Option<Node>,
    _dir: TempDir,
}

#[allow(dead_code)]
impl TestNode {
    /// Start a node on ephemeral ports; `extra` is appended to the base config.
    pub async fn spawn(name: &str, extra: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("config.toml");
        let config_content = format!(
            r#"
[server]
name = "{name}"
node_id = "{name}"
metrics_port = 0

[listen]
address = "127.0.0.1:0"
{extra}
"#
        );
        std::fs::write(&config_path, config_content)?;

        let config = Config::load(&config_path)?;
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid test config: {errors:?}");
        }
        let node = Node::start(&config).await?;
        Ok(Self {
            node: Some(node),
            _dir: dir,
        })
    }

    pub fn node(&self) -> &Node {
        self.node.as_ref().expect("node already stopped")
    }

    pub fn address(&self) -> SocketAddr {
        self.node().client_addr()
    }

    /// Connect a new client to this node.
    pub async fn connect(&self) -> anyhow::Result<super::client::TestClient> {
        super::client::TestClient::connect(self.address()).await
    }

    /// Connect and sign in as `(uid, device)`.
    pub async fn signed_in(
        &self,
        uid: i64,
        device: i64,
    ) -> anyhow::Result<super::client::TestClient> {
        let mut client = self.connect().await?;
        client.sign_in(uid, device).await?;
        Ok(client)
    }

    /// Stop the node and wait for its tasks.
    pub async fn stop(mut self) {
        if let Some(node) = self.node.take() {
            node.shutdown().await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            node.shutdown_token().cancel();
        }
    }
}
