//! Common test utilities for `Lanshake` integration tests.
//!
//! Nodes here listen on loopback ephemeral ports with in-memory stores, so
//! tests can run in parallel without touching the host configuration.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lanshake_core::config::Config;
use lanshake_core::identity::StaticPlatform;
use lanshake_core::interfaces::{InterfaceAddress, StaticInterfaces};
use lanshake_core::node::{Node, NodeBuilder};
use lanshake_core::server::ServerEvent;
use lanshake_core::store::MemoryStore;

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Configuration for a loopback test node.
pub fn test_config(nickname: &str, data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.device_name = nickname.to_string();
    config.general.data_dir = Some(data_dir.to_path_buf());
    config.network.transfer_port_range = (0, 0);
    config.network.connect_timeout = Duration::from_secs(2);
    config.network.read_timeout = Duration::from_secs(3);
    config.transfer.response_timeout = Duration::from_secs(3);
    config.transfer.output_dir = Some(data_dir.join("received"));
    config
}

/// A node plus its event stream and scratch directory.
pub struct TestNode {
    pub node: Node,
    pub events: mpsc::Receiver<ServerEvent>,
    pub dir: tempfile::TempDir,
}

impl TestNode {
    pub fn device_id(&self) -> &str {
        self.node.identity().device_id()
    }

    /// Wait for the next event matching `pick`, skipping the rest.
    pub async fn next_event<T>(&mut self, mut pick: impl FnMut(ServerEvent) -> Option<T>) -> T {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for event")
    }
}

/// Start a node on `127.0.0.1:0`.
pub async fn spawn_node(device_id: &str, nickname: &str) -> TestNode {
    spawn_node_with(device_id, nickname, |_| {}).await
}

/// Start a node after adjusting its configuration.
pub async fn spawn_node_with(
    device_id: &str,
    nickname: &str,
    adjust: impl FnOnce(&mut Config),
) -> TestNode {
    let dir = create_temp_dir();
    let mut config = test_config(nickname, dir.path());
    adjust(&mut config);

    let (node, events) = NodeBuilder::new(config)
        .store(Arc::new(MemoryStore::new()))
        .platform(Arc::new(StaticPlatform::new(device_id)))
        .interfaces(Arc::new(StaticInterfaces(vec![InterfaceAddress::new(
            "lo-test",
            "127.0.0.1".parse().unwrap(),
        )])))
        .bind("127.0.0.1:0".parse().unwrap())
        .start()
        .await
        .expect("Failed to start node");

    TestNode { node, events, dir }
}
