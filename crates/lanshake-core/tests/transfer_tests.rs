//! Transfer negotiation and data phase between live nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use lanshake_core::connection::Channel;
use lanshake_core::index::build_index;
use lanshake_core::protocol::{self, keys, ErrorKind, FileIndexEntry, Message};
use lanshake_core::registry::Device;
use lanshake_core::server::ServerEvent;
use lanshake_core::transfer::{TransferDirection, TransferState};
use lanshake_core::Error;

use common::{
    assert_files_equal, create_temp_dir, create_test_file, random_bytes, spawn_node,
    spawn_node_with, TestNode,
};

async fn introduce(from: &TestNode, to: &TestNode) {
    from.node
        .handler()
        .connect_to(to.node.local_addr())
        .await
        .expect("handshake");
}

#[tokio::test]
async fn test_files_move_end_to_end() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node("bob-id", "Bob").await;
    introduce(&alice, &bob).await;

    let src = create_temp_dir();
    let docs = src.path().join("docs");
    create_test_file(&docs, "readme.txt", b"Hello, Lanshake!");
    create_test_file(&docs, "nested/notes.md", b"# notes");
    let blob = create_test_file(src.path(), "blob.bin", &random_bytes(300 * 1024));

    let entries = build_index(&[docs.clone(), blob.clone()]).unwrap();
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", entries)
        .unwrap();
    assert_eq!(group.state(), TransferState::Created);
    assert_eq!(group.direction, TransferDirection::Outgoing);

    let handle = alice
        .node
        .coordinator()
        .spawn_send(group.group_id, bob.node.local_addr())
        .unwrap();

    let out = create_temp_dir();
    let offer = bob
        .next_event(|event| match event {
            ServerEvent::TransferRequested(offer) => Some(offer),
            _ => None,
        })
        .await;
    assert_eq!(offer.device.device_id, "alice-id");
    assert_eq!(offer.group.group_id, group.group_id);
    assert_eq!(offer.group.direction, TransferDirection::Incoming);
    assert_eq!(offer.group.entries().len(), group.entries().len());
    offer.accept(out.path());

    let sent = handle.task.await.unwrap().expect("send");
    assert_eq!(sent.state(), TransferState::Completed);
    assert!(sent.socket_port().is_some());

    let received = bob
        .next_event(|event| match event {
            ServerEvent::TransferFinished(group) => Some(group),
            _ => None,
        })
        .await;
    assert_eq!(received.state(), TransferState::Completed);

    assert_files_equal(&docs.join("readme.txt"), &out.path().join("docs/readme.txt"));
    assert_files_equal(
        &docs.join("nested/notes.md"),
        &out.path().join("docs/nested/notes.md"),
    );
    assert_files_equal(&blob, &out.path().join("blob.bin"));
    assert_eq!(
        alice.node.coordinator().state(group.group_id).unwrap(),
        Some(TransferState::Completed)
    );
}

#[tokio::test]
async fn test_rejected_offer_ends_both_sides() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node("bob-id", "Bob").await;
    introduce(&alice, &bob).await;

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"unwanted");
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", build_index(&[file]).unwrap())
        .unwrap();
    let handle = alice
        .node
        .coordinator()
        .spawn_send(group.group_id, bob.node.local_addr())
        .unwrap();

    bob.next_event(|event| match event {
        ServerEvent::TransferRequested(offer) => Some(offer),
        _ => None,
    })
    .await
    .reject();

    let err = handle.task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TransferRejected), "got {err:?}");
    assert_eq!(
        alice.node.coordinator().state(group.group_id).unwrap(),
        Some(TransferState::Rejected)
    );
    assert_eq!(
        bob.node.coordinator().state(group.group_id).unwrap(),
        Some(TransferState::Rejected)
    );
}

#[tokio::test]
async fn test_restricted_device_is_rejected_before_index_is_sent() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node("bob-id", "Bob").await;
    introduce(&alice, &bob).await;
    alice.node.registry().set_restricted("bob-id", true).unwrap();

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"secret");
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", build_index(&[file]).unwrap())
        .unwrap();

    let err = alice
        .node
        .coordinator()
        .send(group.group_id, bob.node.local_addr())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");

    let stored = alice.node.coordinator().group(group.group_id).unwrap().unwrap();
    assert_eq!(stored.state(), TransferState::Rejected);
    assert!(bob.node.coordinator().groups().unwrap().is_empty());
    assert!(bob.events.try_recv().is_err());
}

#[tokio::test]
async fn test_receiver_refuses_restricted_sender() {
    let alice = spawn_node("alice-id", "Alice").await;
    let bob = spawn_node("bob-id", "Bob").await;
    introduce(&bob, &alice).await;
    bob.node.registry().set_restricted("alice-id", true).unwrap();
    introduce(&alice, &bob).await;

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"knock knock");
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", build_index(&[file]).unwrap())
        .unwrap();

    let err = alice
        .node
        .coordinator()
        .send(group.group_id, bob.node.local_addr())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");
    assert_eq!(
        alice.node.coordinator().state(group.group_id).unwrap(),
        Some(TransferState::Rejected)
    );
    assert!(bob.node.coordinator().groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_trusted_sender_is_auto_accepted() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node_with("bob-id", "Bob", |config| {
        config.trust.auto_accept_trusted = true;
    })
    .await;
    introduce(&bob, &alice).await;
    bob.node.registry().set_trusted("alice-id", true).unwrap();
    introduce(&alice, &bob).await;

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "photo.jpg", &random_bytes(4096));
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", build_index(&[file.clone()]).unwrap())
        .unwrap();
    let sent = alice
        .node
        .coordinator()
        .send(group.group_id, bob.node.local_addr())
        .await
        .expect("send");
    assert_eq!(sent.state(), TransferState::Completed);

    let received = bob
        .next_event(|event| match event {
            ServerEvent::TransferRequested(_) => panic!("trusted sender should not be asked about"),
            ServerEvent::TransferFinished(group) => Some(group),
            _ => None,
        })
        .await;
    assert_eq!(received.state(), TransferState::Completed);
    assert_files_equal(&file, &bob.node.default_output_dir().join("photo.jpg"));
}

#[tokio::test]
async fn test_known_group_id_is_flagged() {
    let alice = spawn_node("alice-id", "Alice").await;
    let bob = spawn_node("bob-id", "Bob").await;
    bob.node
        .coordinator()
        .register_incoming(42, "alice-id", Vec::new())
        .unwrap();

    let mut channel = Channel::open(
        bob.node.local_addr(),
        Duration::from_secs(1),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    let mut request = Message::new()
        .with(keys::REQUEST, keys::REQUEST_TRANSFER)
        .with(keys::GROUP_ID, 42_u64)
        .with(keys::FILES_INDEX, serde_json::json!([]));
    alice.node.identity().payload().write_into(&mut request);

    let reply = channel.request(&request).await.unwrap();
    assert!(!reply.result());
    assert_eq!(reply.opt_str(keys::FLAG), Some(keys::FLAG_GROUP_EXISTS));
}

#[tokio::test]
async fn test_silent_receiver_fails_with_timeout() {
    let alice = spawn_node_with("alice-id", "Alice", |config| {
        config.transfer.response_timeout = Duration::from_millis(300);
    })
    .await;
    alice
        .node
        .registry()
        .upsert_device(Device::new("ghost-id", "test", "bench", "Ghost"))
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"anyone there?");
    let group = alice
        .node
        .coordinator()
        .create_group("ghost-id", build_index(&[file]).unwrap())
        .unwrap();

    let err = alice
        .node
        .coordinator()
        .send(group.group_id, addr)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(300)), "got {err:?}");

    let stored = alice.node.coordinator().group(group.group_id).unwrap().unwrap();
    assert_eq!(stored.state(), TransferState::Failed);
    assert!(stored.failure().is_some());
    silent.abort();
}

#[tokio::test]
async fn test_cancel_during_data_phase() {
    let alice = spawn_node("alice-id", "Alice").await;
    alice
        .node
        .registry()
        .upsert_device(Device::new("stall-id", "test", "bench", "Stall"))
        .unwrap();

    // Accepts, opens the data socket, then never acknowledges anything.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let staller = tokio::spawn(async move {
        let (mut control, _) = listener.accept().await.unwrap();
        let request = protocol::read_message(&mut control).await.unwrap();
        let group_id = request.require_u64(keys::GROUP_ID).unwrap();
        protocol::write_message(
            &mut control,
            &Message::new()
                .with(keys::RESULT, true)
                .with(keys::REQUEST, keys::REQUEST_RESPONSE)
                .with(keys::GROUP_ID, group_id)
                .with(keys::IS_ACCEPTED, true),
        )
        .await
        .unwrap();
        let start = protocol::read_message(&mut control).await.unwrap();
        let port = u16::try_from(start.require_u64(keys::SOCKET_PORT).unwrap()).unwrap();
        let data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = release_rx.await;
        drop((control, data));
    });

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "big.bin", &random_bytes(64 * 1024));
    let group = alice
        .node
        .coordinator()
        .create_group("stall-id", build_index(&[file]).unwrap())
        .unwrap();
    let mut handle = alice
        .node
        .coordinator()
        .spawn_send(group.group_id, addr)
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        handle
            .progress
            .wait_for(|p| p.state == TransferState::InProgress),
    )
    .await
    .expect("transfer never started")
    .expect("progress channel closed");

    assert!(alice.node.coordinator().cancel(group.group_id).unwrap());
    let err = handle.task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Interrupted), "got {err:?}");

    let stored = alice.node.coordinator().group(group.group_id).unwrap().unwrap();
    assert_eq!(stored.state(), TransferState::Cancelled);
    assert!(alice.node.coordinator().progress(group.group_id).is_none());

    let _ = release_tx.send(());
    staller.await.unwrap();
}

#[tokio::test]
async fn test_create_group_requires_known_device_and_entries() {
    let alice = spawn_node("alice-id", "Alice").await;
    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"x");

    let err = alice
        .node
        .coordinator()
        .create_group("nobody", build_index(&[file]).unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

    alice
        .node
        .registry()
        .upsert_device(Device::new("bob-id", "test", "bench", "Bob"))
        .unwrap();
    let err = alice
        .node
        .coordinator()
        .create_group("bob-id", Vec::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "got {err:?}");
}

#[tokio::test]
async fn test_group_ids_are_unique() {
    let alice = spawn_node("alice-id", "Alice").await;
    alice
        .node
        .registry()
        .upsert_device(Device::new("bob-id", "test", "bench", "Bob"))
        .unwrap();
    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"x");
    let entries = build_index(&[file]).unwrap();

    let mut ids = std::collections::HashSet::new();
    for _ in 0..50 {
        let group = alice
            .node
            .coordinator()
            .create_group("bob-id", entries.clone())
            .unwrap();
        assert!(ids.insert(group.group_id));
    }
}

/// Offer `entries` to `to` as `from` over a raw channel, as a hand-driven sender.
async fn offer_raw(
    from: &TestNode,
    to: &TestNode,
    group_id: u64,
    entries: &[FileIndexEntry],
) -> Channel {
    let mut channel = Channel::open(
        to.node.local_addr(),
        Duration::from_secs(3),
        Duration::from_secs(3),
    )
    .await
    .unwrap();
    let mut request = Message::new()
        .with(keys::REQUEST, keys::REQUEST_TRANSFER)
        .with(keys::GROUP_ID, group_id)
        .with(keys::FILES_INDEX, protocol::encode_index(entries).unwrap());
    from.node.identity().payload().write_into(&mut request);
    channel.send(&request).await.unwrap();
    channel
}

async fn accept_next_offer(node: &mut TestNode, output_dir: &std::path::Path) {
    node.next_event(|event| match event {
        ServerEvent::TransferRequested(offer) => Some(offer),
        _ => None,
    })
    .await
    .accept(output_dir);
}

async fn next_finished(node: &mut TestNode) -> lanshake_core::transfer::TransferGroup {
    node.next_event(|event| match event {
        ServerEvent::TransferFinished(group) => Some(group),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_receiver_refuses_entries_outside_the_accepted_index() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node("bob-id", "Bob").await;

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"a");
    let entries = build_index(&[file]).unwrap();
    let out = create_temp_dir();

    let mut control = offer_raw(&alice, &bob, 77, &entries).await;
    accept_next_offer(&mut bob, out.path()).await;
    let reply = control.receive().await.unwrap();
    assert_eq!(reply.opt_bool(keys::IS_ACCEPTED), Some(true));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    control
        .send(
            &Message::new()
                .with(keys::GROUP_ID, 77_u64)
                .with(keys::SOCKET_PORT, port),
        )
        .await
        .unwrap();
    let (mut data, _) = listener.accept().await.unwrap();

    protocol::write_message(
        &mut data,
        &Message::new()
            .with(keys::REQUEST_ID, 0_u64)
            .with(keys::FILE, "evil.bin")
            .with(keys::FILE_SIZE, 5000_u64)
            .with(keys::DIRECTORY, false),
    )
    .await
    .unwrap();
    let ack = protocol::read_message(&mut data).await.unwrap();
    assert!(!ack.result());
    assert_eq!(ack.error_kind(), Some(ErrorKind::NotAllowed));

    let finished = next_finished(&mut bob).await;
    assert_eq!(finished.group_id, 77);
    assert_eq!(finished.state(), TransferState::Failed);
    assert!(!out.path().join("evil.bin").exists());
    assert!(!out.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_accepted_offer_fails_when_sender_vanishes() {
    let alice = spawn_node("alice-id", "Alice").await;
    let mut bob = spawn_node("bob-id", "Bob").await;

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"a");
    let entries = build_index(&[file]).unwrap();
    let out = create_temp_dir();

    let mut control = offer_raw(&alice, &bob, 78, &entries).await;
    accept_next_offer(&mut bob, out.path()).await;
    let reply = control.receive().await.unwrap();
    assert_eq!(reply.opt_bool(keys::IS_ACCEPTED), Some(true));
    drop(control);

    let finished = next_finished(&mut bob).await;
    assert_eq!(finished.group_id, 78);
    assert_eq!(finished.state(), TransferState::Failed);
    assert!(finished.failure().is_some());
    assert_eq!(
        bob.node.coordinator().state(78).unwrap(),
        Some(TransferState::Failed)
    );
}

#[tokio::test]
async fn test_undrained_events_do_not_stall_requests() {
    let alice = spawn_node("alice-id", "Alice").await;
    let bob = spawn_node_with("bob-id", "Bob", |config| {
        config.transfer.response_timeout = Duration::from_millis(500);
    })
    .await;
    introduce(&alice, &bob).await;
    let addr = bob.node.local_addr();

    // Each push queues two events on a node nobody listens to.
    for i in 0..48 {
        alice
            .node
            .coordinator()
            .send_clipboard("bob-id", addr, &format!("note {i}"))
            .await
            .unwrap_or_else(|e| panic!("push {i} failed: {e}"));
    }

    let src = create_temp_dir();
    let file = create_test_file(src.path(), "a.txt", b"a");
    let group = alice
        .node
        .coordinator()
        .create_group("bob-id", build_index(&[file]).unwrap())
        .unwrap();
    let err = alice
        .node
        .coordinator()
        .send(group.group_id, addr)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransferRejected), "got {err:?}");
    drop(bob);
}

#[tokio::test]
async fn test_broken_data_socket_records_skipped_bytes() {
    let alice = spawn_node("alice-id", "Alice").await;
    alice
        .node
        .registry()
        .upsert_device(Device::new("flaky-id", "test", "bench", "Flaky"))
        .unwrap();

    // Accepts, takes a little of the first entry, then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let flaky = tokio::spawn(async move {
        let (mut control, _) = listener.accept().await.unwrap();
        let request = protocol::read_message(&mut control).await.unwrap();
        let group_id = request.require_u64(keys::GROUP_ID).unwrap();
        protocol::write_message(
            &mut control,
            &Message::new()
                .with(keys::RESULT, true)
                .with(keys::REQUEST, keys::REQUEST_RESPONSE)
                .with(keys::GROUP_ID, group_id)
                .with(keys::IS_ACCEPTED, true),
        )
        .await
        .unwrap();
        let start = protocol::read_message(&mut control).await.unwrap();
        let port = u16::try_from(start.require_u64(keys::SOCKET_PORT).unwrap()).unwrap();
        let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        protocol::read_message(&mut data).await.unwrap();
        let mut partial = vec![0u8; 16 * 1024];
        data.read_exact(&mut partial).await.unwrap();
        drop((control, data));
    });

    let size = 24 * 1024 * 1024;
    let src = create_temp_dir();
    let file = create_test_file(src.path(), "large.bin", &random_bytes(size));
    let group = alice
        .node
        .coordinator()
        .create_group("flaky-id", build_index(&[file]).unwrap())
        .unwrap();

    let err = alice
        .node
        .coordinator()
        .send(group.group_id, addr)
        .await
        .unwrap_err();
    assert!(!matches!(err, Error::Interrupted), "got {err:?}");
    flaky.await.unwrap();

    let stored = alice.node.coordinator().group(group.group_id).unwrap().unwrap();
    assert_eq!(stored.state(), TransferState::Failed);
    assert!(stored.skipped_bytes() >= 16 * 1024);
    assert!(stored.skipped_bytes() < size as u64);
}

#[tokio::test]
async fn test_concurrent_offers_register_a_group_once() {
    let bob = spawn_node("bob-id", "Bob").await;
    let coordinator = Arc::clone(bob.node.coordinator());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            tokio::task::spawn_blocking(move || {
                coordinator.register_incoming(99, &format!("peer-{i}"), Vec::new())
            })
        })
        .collect();

    let mut registered = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => registered += 1,
            Err(err) => assert!(matches!(err, Error::GroupExists(99)), "got {err:?}"),
        }
    }
    assert_eq!(registered, 1);
    assert_eq!(coordinator.groups().unwrap().len(), 1);
}
