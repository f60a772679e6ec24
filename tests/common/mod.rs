//! Integration test common infrastructure.
//!
//! Provides utilities for starting in-process nodes, creating test clients,
//! and asserting on message flows.

pub mod client;
pub mod node;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use node::TestNode;

use std::time::Duration;

/// Poll `check` until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
