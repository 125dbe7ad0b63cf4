//! End-to-end relay scenarios over in-memory sockets.

use std::time::Duration;

use horizon_core::{
    AdmissionError, AuthFailure, AuthMethod, Relay, RelayConfig, TokenRejection,
    testutil::{MockPeer, MockSink, SimEnv},
};
use horizon_proto::{CloseCode, ConnectRequest, Envelope, Message, kind};

type TestRelay = Relay<MockSink, SimEnv>;

fn relay(seed: u64) -> TestRelay {
    Relay::new(SimEnv::with_seed(seed), RelayConfig::default()).unwrap()
}

async fn join(relay: &TestRelay, identity: &str) -> (horizon_core::Admitted, MockPeer) {
    let token = relay.issue(identity).unwrap().token;
    let (sink, peer) = MockSink::pair();
    let admitted = relay.admit(&ConnectRequest::with_token(identity, token), sink).await.unwrap();
    (admitted, peer)
}

#[tokio::test(start_paused = true)]
async fn key_revocation_reaches_everyone_but_the_revoker() {
    let relay = relay(1);
    let (_, alice) = join(&relay, "did:example:alice").await;
    let (_, bob) = join(&relay, "did:example:bob").await;

    let delivered = relay.announce_key_revoked("did:example:alice").await;

    assert_eq!(delivered, 1);
    assert_eq!(alice.kinds(), vec![kind::WELCOME]);
    assert_eq!(bob.kinds(), vec![kind::WELCOME, kind::KEY_REVOKED]);

    let notice = bob.envelopes().pop().unwrap();
    let Message::KeyRevoked(revoked) = notice.message else { panic!("expected key_revoked") };
    assert_eq!(revoked.did, "did:example:alice");
    assert_eq!(revoked.message, "Public key has been revoked");
}

#[tokio::test(start_paused = true)]
async fn conversation_over_one_connection() {
    let relay = relay(2);
    let (admitted, peer) = join(&relay, "did:example:alice").await;
    let id = admitted.id;

    for raw in [
        br#"{"type":"ping","data":{"timestamp":"t0"}}"#.as_slice(),
        br#"{"type":"status","data":{}}"#,
        br#"{"type":"chat","data":{"ciphertext":"abc"},"timestamp":"t1"}"#,
        b"{broken",
    ] {
        relay.handle_frame("did:example:alice", id, raw).await.unwrap();
    }

    assert_eq!(
        peer.kinds(),
        vec![kind::WELCOME, kind::PONG, kind::STATUS, kind::ECHO, kind::ERROR]
    );

    let envelopes = peer.envelopes();
    let Message::Status(status) = &envelopes[2].message else { panic!("expected status") };
    assert!(status.connected);
    assert_eq!(status.identity, "did:example:alice");

    let echo = envelopes[3].to_json().unwrap();
    let echo: serde_json::Value = serde_json::from_slice(&echo).unwrap();
    assert_eq!(echo["data"]["ciphertext"], "abc");
}

#[tokio::test(start_paused = true)]
async fn reconnect_replaces_previous_socket() {
    let relay = relay(3);
    let (first, first_peer) = join(&relay, "did:example:alice").await;
    let (second, second_peer) = join(&relay, "did:example:alice").await;

    assert_eq!(first_peer.close_code(), Some(CloseCode::Normal));
    assert_eq!(relay.connection_count().await, 1);

    // The old read loop ending must not take the new connection down.
    assert!(!relay.release("did:example:alice", first.id).await);
    assert!(relay.deliver("did:example:alice", &Envelope::from(Message::Echo(serde_json::json!({})))).await);
    assert_eq!(second_peer.kinds(), vec![kind::WELCOME, kind::ECHO]);

    assert!(relay.release("did:example:alice", second.id).await);
    assert_eq!(relay.connection_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn revoked_and_blacklisted_tokens_cannot_connect() {
    let relay = relay(4);
    let revoked = relay.issue("did:a").unwrap().token;
    let blacklisted = relay.issue("did:a").unwrap().token;
    assert!(relay.revoke_token(&revoked));
    assert!(relay.blacklist_token(&blacklisted));

    for (token, rejection) in
        [(revoked, TokenRejection::Revoked), (blacklisted, TokenRejection::Blacklisted)]
    {
        let (sink, peer) = MockSink::pair();
        let err = relay.admit(&ConnectRequest::with_token("did:a", token), sink).await.unwrap_err();
        assert_eq!(err, AdmissionError::Unauthenticated(AuthFailure::Token(rejection)));
        assert!(peer.frames().is_empty());
    }
    assert_eq!(relay.connection_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn signature_admission() {
    let relay = relay(5);
    let signed = relay.credentials().sign_identity("did:a").unwrap();
    let (sink, _peer) = MockSink::pair();

    let admitted = relay
        .admit(&ConnectRequest::with_signature("did:a", signed.signature, signed.timestamp), sink)
        .await
        .unwrap();

    assert_eq!(admitted.method, AuthMethod::Signature);
    assert!(relay.connected_identities().await.contains("did:a"));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_evicted_while_chatty_peer_survives() {
    let relay = relay(6);
    let (_, silent) = join(&relay, "did:silent").await;
    let (chatty, chatty_peer) = join(&relay, "did:chatty").await;
    let tasks = relay.start();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        relay.handle_frame("did:chatty", chatty.id, br#"{"type":"heartbeat"}"#).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(silent.close_code(), Some(CloseCode::StaleConnection));
    assert!(!chatty_peer.is_closed());
    assert!(chatty_peer.kinds().iter().filter(|k| *k == kind::HEARTBEAT).count() >= 3);
    assert_eq!(relay.connected_identities().await.len(), 1);

    tasks.stop().await;
    relay.shutdown().await;
    assert_eq!(chatty_peer.close_code(), Some(CloseCode::GoingAway));
}
