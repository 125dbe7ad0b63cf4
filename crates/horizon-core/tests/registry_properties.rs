//! Model-based property tests for the connection registry.
//!
//! Random operation sequences run against the real registry (driven on a
//! paused current-thread runtime) and a plain reference model. After every
//! step the set of connected identities must match the model, and every
//! broadcast count must match what the model predicts.

use std::collections::{HashMap, HashSet};

use horizon_core::{
    ConnectionRegistry, Delivery, Disconnect, RegistryConfig,
    testutil::{MockPeer, MockSink, SimEnv},
};
use horizon_proto::{CloseCode, Envelope, Message, Pong};
use proptest::prelude::*;

const IDENTITIES: usize = 5;

#[derive(Debug, Clone)]
enum Operation {
    Connect(usize),
    Disconnect(usize),
    Send(usize),
    Broadcast(Option<usize>),
    BreakSocket(usize),
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (0..IDENTITIES).prop_map(Operation::Connect),
        1 => (0..IDENTITIES).prop_map(Operation::Disconnect),
        2 => (0..IDENTITIES).prop_map(Operation::Send),
        2 => proptest::option::of(0..IDENTITIES).prop_map(Operation::Broadcast),
        1 => (0..IDENTITIES).prop_map(Operation::BreakSocket),
    ]
}

fn identity(i: usize) -> String {
    format!("did:test:{i}")
}

fn envelope() -> Envelope {
    Envelope::new(Message::Pong(Pong { timestamp: None }))
}

/// Reference model: identity -> is the socket broken
#[derive(Default)]
struct Model {
    live: HashMap<usize, bool>,
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn registry_matches_model(ops in prop::collection::vec(operation(), 1..40)) {
        runtime().block_on(async {
            let registry = ConnectionRegistry::new(SimEnv::with_seed(1), RegistryConfig::default());
            let mut model = Model::default();
            let mut peers: HashMap<usize, MockPeer> = HashMap::new();
            let mut replaced: Vec<MockPeer> = Vec::new();

            for op in ops {
                match op {
                    Operation::Connect(i) => {
                        let (sink, peer) = MockSink::pair();
                        registry.connect(&identity(i), sink).await.unwrap();
                        if let Some(old) = peers.insert(i, peer)
                            && model.live.contains_key(&i)
                        {
                            replaced.push(old);
                        }
                        model.live.insert(i, false);
                    },
                    Operation::Disconnect(i) => {
                        let expected = if model.live.remove(&i).is_some() {
                            Disconnect::Removed
                        } else {
                            Disconnect::Absent
                        };
                        prop_assert_eq!(registry.disconnect(&identity(i)).await, expected);
                    },
                    Operation::Send(i) => {
                        let expected = match model.live.get(&i) {
                            None => Delivery::NotConnected,
                            Some(false) => Delivery::Delivered,
                            Some(true) => {
                                model.live.remove(&i);
                                Delivery::SendFailed
                            },
                        };
                        prop_assert_eq!(registry.send(&identity(i), &envelope()).await.unwrap(), expected);
                    },
                    Operation::Broadcast(exclude) => {
                        let before = registry.count().await;
                        let excluded_connected = exclude.is_some_and(|e| model.live.contains_key(&e));
                        let expected = model
                            .live
                            .iter()
                            .filter(|(i, broken)| Some(**i) != exclude && !**broken)
                            .count();
                        model.live.retain(|i, broken| Some(*i) == exclude || !*broken);

                        let excluded = exclude.map(identity);
                        let delivered = registry.broadcast(&envelope(), excluded.as_deref()).await.unwrap();

                        prop_assert_eq!(delivered, expected);
                        prop_assert!(delivered <= before - usize::from(excluded_connected));
                    },
                    Operation::BreakSocket(i) => {
                        if let (Some(peer), Some(broken)) = (peers.get(&i), model.live.get_mut(&i)) {
                            peer.fail_sends(true);
                            *broken = true;
                        }
                    },
                }

                let expected: HashSet<String> = model.live.keys().map(|i| identity(*i)).collect();
                prop_assert_eq!(registry.identities().await, expected);
                prop_assert_eq!(registry.count().await, model.live.len());
            }

            for peer in replaced {
                prop_assert_eq!(peer.close_code(), Some(CloseCode::Normal));
            }
            Ok(())
        })?;
    }
}
