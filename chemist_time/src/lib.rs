//! Abstraction over the system clock so that components stamping lifecycle
//! events can be driven deterministically in tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};

/// Error parsing an RFC 3339 timestamp, re-exported so that callers need no
/// direct chrono dependency.
pub use chrono::ParseError;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A wall-clock instant with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create a `Time` from the given number of nanoseconds since the epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Create a `Time` from the given number of milliseconds since the epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Create a `Time` from an RFC 3339 / ISO-8601 string.
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
    }

    /// Nanoseconds since the epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Render as an RFC 3339 string.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Elapsed duration since `earlier`, or `None` if `earlier` is in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + chrono::Duration::from_std(rhs).expect("duration overflow"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - chrono::Duration::from_std(rhs).expect("duration overflow"))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that only advances when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider pinned to the given instant.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Pin the provider to the given instant.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance the clock, returning the new instant.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_provider_advances() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_provider_is_pinned() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), provider.now());

        let later = provider.inc(Duration::from_nanos(10));
        assert_eq!(later, Time::from_timestamp_nanos(10));
        assert_eq!(provider.now(), later);

        provider.set(Time::from_timestamp_nanos(42));
        assert_eq!(provider.now().timestamp_nanos(), 42);
    }

    #[test]
    fn duration_since() {
        let t0 = Time::from_timestamp_millis(100);
        let t1 = Time::from_timestamp_millis(350);
        assert_eq!(
            t1.checked_duration_since(t0),
            Some(Duration::from_millis(250))
        );
        assert_eq!(t0.checked_duration_since(t1), None);
    }

    #[test]
    fn rfc3339_roundtrip() {
        let t = Time::from_timestamp_millis(1_600_000_000_000);
        let parsed = Time::from_rfc3339(&t.to_rfc3339()).unwrap();
        assert_eq!(parsed, t);
    }
}
