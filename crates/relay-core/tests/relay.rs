//! End-to-end tests for the relay core.
//!
//! Sessions are driven over the in-memory channel transport, so these tests
//! exercise the registry, the broadcast engine and the session handlers
//! together without any sockets.

use relay_core::{BroadcastEngine, ClientRegistry, SessionError, SessionHandler};
use relay_protocol::ChatMessage;
use relay_transport::channel::{self, ChannelClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Relay {
    registry: Arc<ClientRegistry>,
    engine: BroadcastEngine,
    shutdown: CancellationToken,
}

impl Relay {
    fn new() -> Self {
        let registry = Arc::new(ClientRegistry::new());
        Self {
            engine: BroadcastEngine::new(Arc::clone(&registry)),
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    fn connect(&self) -> (JoinHandle<Result<(), SessionError>>, ChannelClient) {
        let (connection, client) = channel::pair(64);
        let handler =
            SessionHandler::new(connection, self.engine.clone(), self.shutdown.child_token());
        (tokio::spawn(handler.run()), client)
    }

    async fn wait_for_count(&self, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while self.registry.count() != expected {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {} sessions, registry has {}",
                expected,
                self.registry.count()
            )
        });
    }
}

async fn next(client: &mut ChannelClient) -> ChatMessage {
    timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("connection closed")
}

#[tokio::test]
async fn test_three_clients_all_receive() {
    let relay = Relay::new();
    let (_a, mut alice) = relay.connect();
    let (_b, mut bob) = relay.connect();
    let (_c, mut carol) = relay.connect();
    relay.wait_for_count(3).await;

    alice.send(ChatMessage::new("alice", "hi")).await.unwrap();

    let expected = ChatMessage::new("alice", "hi");
    assert_eq!(next(&mut alice).await, expected);
    assert_eq!(next(&mut bob).await, expected);
    assert_eq!(next(&mut carol).await, expected);
}

#[tokio::test]
async fn test_disconnect_decrements_count_once() {
    let relay = Relay::new();
    let (_a, mut alice) = relay.connect();
    let (b, bob) = relay.connect();
    let (_c, mut carol) = relay.connect();
    relay.wait_for_count(3).await;

    drop(bob);
    assert!(b.await.unwrap().is_ok());
    assert_eq!(relay.registry.count(), 2);

    alice.send(ChatMessage::new("alice", "still there?")).await.unwrap();
    assert_eq!(next(&mut alice).await.message, "still there?");
    assert_eq!(next(&mut carol).await.message, "still there?");
    assert_eq!(relay.registry.count(), 2);
}

#[tokio::test]
async fn test_messages_from_one_sender_stay_in_order() {
    let relay = Relay::new();
    let (_a, alice) = relay.connect();
    let (_b, mut bob) = relay.connect();
    relay.wait_for_count(2).await;

    for i in 0..20 {
        alice
            .send(ChatMessage::new("alice", format!("msg-{i}")))
            .await
            .unwrap();
    }

    for i in 0..20 {
        assert_eq!(next(&mut bob).await.message, format!("msg-{i}"));
    }
}

#[tokio::test]
async fn test_dead_recipient_does_not_affect_others() {
    let relay = Relay::new();
    let (_a, mut alice) = relay.connect();
    let (_b, mut bob) = relay.connect();
    let (_c, mut carol) = relay.connect();
    relay.wait_for_count(3).await;

    bob.close_outbound();
    alice.send(ChatMessage::new("alice", "one")).await.unwrap();
    assert_eq!(next(&mut alice).await.message, "one");
    assert_eq!(next(&mut carol).await.message, "one");
    relay.wait_for_count(2).await;

    alice.send(ChatMessage::new("alice", "two")).await.unwrap();
    assert_eq!(next(&mut alice).await.message, "two");
    assert_eq!(next(&mut carol).await.message, "two");
    assert!(bob.try_recv().is_none());
}

#[tokio::test]
async fn test_shutdown_cancels_every_session() {
    let relay = Relay::new();
    let sessions: Vec<_> = (0..5).map(|_| relay.connect()).collect();
    relay.wait_for_count(5).await;

    relay.shutdown.cancel();

    for (task, _client) in sessions {
        let result = timeout(Duration::from_secs(1), task)
            .await
            .expect("session ignored shutdown")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }
    assert!(relay.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_each_deliver_to_all() {
    let relay = Relay::new();
    let mut clients: Vec<_> = (0..8).map(|_| relay.connect()).collect();
    relay.wait_for_count(8).await;

    for (i, (_, client)) in clients.iter().enumerate() {
        client
            .send(ChatMessage::new(format!("user-{i}"), "hello"))
            .await
            .unwrap();
    }

    for (_, client) in &mut clients {
        let mut senders = Vec::new();
        for _ in 0..8 {
            senders.push(next(client).await.sender);
        }
        senders.sort();
        let mut expected: Vec<_> = (0..8).map(|i| format!("user-{i}")).collect();
        expected.sort();
        assert_eq!(senders, expected);
    }
    assert_eq!(relay.registry.count(), 8);
}
