//! Environment abstraction for deterministic testing.
//!
//! Decouples relay logic from system resources (time, randomness). Tests run
//! against a virtual clock and seeded RNG; production uses the real system.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`, simulation the tokio virtual
    /// clock.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time. Drives liveness.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time. Drives token expiry and signature windows.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// Only background loops call this.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Current wall-clock time as an ISO-8601 string (UTC, microseconds).
    fn iso_timestamp(&self) -> String {
        self.wall_clock().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Generates a random `u128`.
    ///
    /// Used for token ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}
