//! Deterministic test doubles.
//!
//! Feature-gated behind `testutil` so they never reach production builds.
//!
//! - [`SimEnv`]: virtual clock (tokio's, so `start_paused` tests control it)
//!   plus a seeded ChaCha RNG.
//! - [`MockSink`]: channel-free in-memory socket with injectable failures,
//!   observed through its [`MockPeer`].
//!
//! ```toml
//! [dev-dependencies]
//! horizon-core = { path = "../horizon-core", features = ["testutil"] }
//! ```

#![allow(clippy::disallowed_types, reason = "Synchronous test state only")]
#![allow(clippy::expect_used, reason = "Lock poisoning should cause a panic")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use horizon_proto::{CloseCode, Envelope, decode_frame};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{env::Environment, error::SinkError, registry::ConnectionSink};

/// Wall-clock time at which every [`SimEnv`] starts.
pub fn sim_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

struct SimState {
    rng: ChaCha20Rng,
    wall_offset: Duration,
    zero_entropy: bool,
}

/// Simulated environment.
///
/// Monotonic time is tokio's clock, so tests using
/// `#[tokio::test(start_paused = true)]` advance it with
/// `tokio::time::advance` or by sleeping. Wall-clock time is [`sim_epoch`]
/// plus the tokio time elapsed since creation plus any manual offset.
#[derive(Clone)]
pub struct SimEnv {
    start: tokio::time::Instant,
    state: Arc<Mutex<SimState>>,
}

impl SimEnv {
    /// Create an environment with a seeded RNG.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            start: tokio::time::Instant::now(),
            state: Arc::new(Mutex::new(SimState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                wall_offset: Duration::ZERO,
                zero_entropy: false,
            })),
        }
    }

    /// Move the wall clock forward without touching monotonic time.
    pub fn advance_wall_clock(&self, by: Duration) {
        self.state.lock().expect("SimEnv mutex poisoned").wall_offset += by;
    }

    /// Make `random_bytes` return zeroes, simulating a broken RNG.
    pub fn set_zero_entropy(&self, enabled: bool) {
        self.state.lock().expect("SimEnv mutex poisoned").zero_entropy = enabled;
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let offset = self.state.lock().expect("SimEnv mutex poisoned").wall_offset;
        let elapsed = self.start.elapsed() + offset;
        sim_epoch() + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut state = self.state.lock().expect("SimEnv mutex poisoned");
        if state.zero_entropy {
            buffer.fill(0);
        } else {
            state.rng.fill_bytes(buffer);
        }
    }
}

#[derive(Default)]
struct MockShared {
    frames: Mutex<Vec<Bytes>>,
    closed: Mutex<Option<(CloseCode, String)>>,
    fail_accept: AtomicBool,
    fail_send: AtomicBool,
    fail_close: AtomicBool,
}

/// In-memory [`ConnectionSink`].
///
/// Sends after close fail with [`SinkError::Closed`], like a real socket.
pub struct MockSink {
    shared: Arc<MockShared>,
}

/// Observer and failure injector for a [`MockSink`].
#[derive(Clone)]
pub struct MockPeer {
    shared: Arc<MockShared>,
}

impl MockSink {
    /// A sink and its peer handle.
    pub fn pair() -> (Self, MockPeer) {
        let shared = Arc::new(MockShared::default());
        (Self { shared: Arc::clone(&shared) }, MockPeer { shared })
    }
}

#[async_trait]
impl ConnectionSink for MockSink {
    async fn accept(&self) -> Result<(), SinkError> {
        if self.shared.fail_accept.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("injected accept failure".to_string()));
        }
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        if self.shared.closed.lock().expect("MockSink mutex poisoned").is_some() {
            return Err(SinkError::Closed);
        }
        if self.shared.fail_send.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("injected send failure".to_string()));
        }
        self.shared.frames.lock().expect("MockSink mutex poisoned").push(frame);
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SinkError> {
        let mut closed = self.shared.closed.lock().expect("MockSink mutex poisoned");
        if closed.is_none() {
            *closed = Some((code, reason.to_string()));
        }
        if self.shared.fail_close.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("injected close failure".to_string()));
        }
        Ok(())
    }
}

impl MockPeer {
    /// Make the accept step fail.
    pub fn fail_accept(&self, enabled: bool) {
        self.shared.fail_accept.store(enabled, Ordering::SeqCst);
    }

    /// Make every send fail.
    pub fn fail_sends(&self, enabled: bool) {
        self.shared.fail_send.store(enabled, Ordering::SeqCst);
    }

    /// Make close report an error (the sink still counts as closed).
    pub fn fail_close(&self, enabled: bool) {
        self.shared.fail_close.store(enabled, Ordering::SeqCst);
    }

    /// Raw frames received so far.
    pub fn frames(&self) -> Vec<Bytes> {
        self.shared.frames.lock().expect("MockSink mutex poisoned").clone()
    }

    /// Decoded envelopes received so far. Undecodable frames are skipped.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.frames()
            .iter()
            .filter_map(|frame| {
                let (payload, _) = decode_frame(frame).ok()?;
                Envelope::from_json(payload).ok()
            })
            .collect()
    }

    /// `type` of every envelope received so far.
    pub fn kinds(&self) -> Vec<String> {
        self.envelopes().iter().map(|e| e.kind().to_string()).collect()
    }

    /// Close code, once closed.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.shared.closed.lock().expect("MockSink mutex poisoned").as_ref().map(|(code, _)| *code)
    }

    /// True once the sink was closed.
    pub fn is_closed(&self) -> bool {
        self.close_code().is_some()
    }
}
