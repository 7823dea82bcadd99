//! Stream time sources: PTP per domain with transparent local fallback.
//!
//! Every stream gets its time from a per-domain clock handle. Domain -1 is
//! the free-running local clock. Domains 0..=127 consult an external PTP
//! helper when one is installed and locked, and silently fall back to the
//! local clock otherwise, so callers never see time stop. A process-wide
//! registry deduplicates handles per domain; handles stay alive as long as
//! any stream holds one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};

use crate::descriptor::StreamDescriptor;

/// Monotonic reference time consumed by receivers and transmitters.
pub trait ClockSource: Send + Sync {
    /// Monotonic, non-decreasing nanosecond count.
    fn now_ns(&self) -> u64;

    /// Whether the source is synchronized to a network grandmaster.
    fn is_locked(&self) -> bool;

    /// Offset from the grandmaster in nanoseconds (0 when free-running).
    fn offset_ns(&self) -> i64;

    /// Grandmaster identity, when known.
    fn master_id(&self) -> Option<String> {
        None
    }

    fn now_us(&self) -> u64 {
        self.now_ns() / 1_000
    }

    fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }
}

/// Handle shared by every stream in one PTP domain.
pub type ClockHandle = Arc<PtpClock>;

/// Boundary to the external PTP synchronization helper. The helper may be
/// absent or permanently unlocked; the core is correct either way.
pub trait PtpHelper: Send + Sync {
    fn now_ns(&self) -> u64;
    fn is_locked(&self) -> bool;
    fn offset_ns(&self) -> i64;
    fn master_id(&self) -> Option<String>;
}

/// Free-running monotonic clock.
pub struct LocalClock {
    origin: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for LocalClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn is_locked(&self) -> bool {
        false
    }

    fn offset_ns(&self) -> i64 {
        0
    }
}

/// Per-domain clock: PTP helper when locked, local clock otherwise.
///
/// `now_ns` never decreases even if the helper's time steps backwards
/// during a resync; the last published value is a floor.
pub struct PtpClock {
    domain: i16,
    local: LocalClock,
    helper: RwLock<Option<Arc<dyn PtpHelper>>>,
    last_ns: AtomicU64,
}

impl PtpClock {
    fn new(domain: i16) -> Self {
        Self {
            domain,
            local: LocalClock::new(),
            helper: RwLock::new(None),
            last_ns: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> i16 {
        self.domain
    }

    /// Install (or clear) the external synchronization helper.
    pub fn set_helper(&self, helper: Option<Arc<dyn PtpHelper>>) {
        *self.helper.write() = helper;
    }

    fn helper_if_active(&self) -> Option<Arc<dyn PtpHelper>> {
        if self.domain < 0 || !registry_enabled() {
            return None;
        }
        let guard = self.helper.read();
        guard.as_ref().filter(|h| h.is_locked()).cloned()
    }
}

impl ClockSource for PtpClock {
    fn now_ns(&self) -> u64 {
        let raw = match self.helper_if_active() {
            Some(helper) => helper.now_ns(),
            None => self.local.now_ns(),
        };
        let floor = self.last_ns.fetch_max(raw, Ordering::AcqRel);
        raw.max(floor)
    }

    fn is_locked(&self) -> bool {
        self.helper_if_active().is_some()
    }

    fn offset_ns(&self) -> i64 {
        match self.helper_if_active() {
            Some(helper) => helper.offset_ns(),
            None => 0,
        }
    }

    fn master_id(&self) -> Option<String> {
        self.helper_if_active().and_then(|h| h.master_id())
    }
}

struct Registry {
    clocks: Mutex<HashMap<i16, ClockHandle>>,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        clocks: Mutex::new(HashMap::new()),
    };
}

static REGISTRY_ENABLED: AtomicBool = AtomicBool::new(true);

/// Clock handle for a domain, created on first use. Domains below zero all
/// alias the local-clock handle at -1.
pub fn get(domain: i16) -> ClockHandle {
    let domain = domain.max(-1);
    REGISTRY
        .clocks
        .lock()
        .entry(domain)
        .or_insert_with(|| Arc::new(PtpClock::new(domain)))
        .clone()
}

/// Drop the registry's reference for a domain. Streams still holding the
/// handle keep it alive; the next `get` creates a fresh clock.
pub fn remove(domain: i16) {
    REGISTRY.clocks.lock().remove(&domain.max(-1));
}

/// Globally enable or disable PTP. While disabled every handle behaves as
/// the local clock.
pub fn set_registry_enabled(enabled: bool) {
    REGISTRY_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn registry_enabled() -> bool {
    REGISTRY_ENABLED.load(Ordering::SeqCst)
}

/// The clock a stream should use: its PTP domain's handle, or local time
/// for domain -1.
pub fn time_for_stream(descriptor: &StreamDescriptor) -> u64 {
    get(descriptor.ptp_domain).now_ns()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHelper {
        now: AtomicU64,
        locked: AtomicBool,
    }

    impl FakeHelper {
        fn new(now: u64, locked: bool) -> Arc<Self> {
            Arc::new(Self {
                now: AtomicU64::new(now),
                locked: AtomicBool::new(locked),
            })
        }
    }

    impl PtpHelper for FakeHelper {
        fn now_ns(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
        fn is_locked(&self) -> bool {
            self.locked.load(Ordering::SeqCst)
        }
        fn offset_ns(&self) -> i64 {
            -1500
        }
        fn master_id(&self) -> Option<String> {
            Some("00-1B-21-AC-B5-4F".to_string())
        }
    }

    #[test]
    fn local_clock_is_monotonic_and_unlocked() {
        let clock = LocalClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert!(!clock.is_locked());
        assert_eq!(clock.offset_ns(), 0);
    }

    #[test]
    fn unit_conversions_divide_down() {
        let clock = get(-1);
        let ns = clock.now_ns();
        let us = clock.now_us();
        let ms = clock.now_ms();
        assert!(us <= ns / 1_000 + 1);
        assert!(ms <= us / 1_000 + 1);
    }

    #[test]
    fn registry_returns_same_handle() {
        let a = get(40);
        let b = get(40);
        assert!(Arc::ptr_eq(&a, &b));
        let c = get(41);
        assert!(!Arc::ptr_eq(&a, &c));
        remove(40);
        remove(41);
    }

    #[test]
    fn remove_leaves_holders_alive() {
        let a = get(42);
        remove(42);
        // Still usable; registry just forgot it.
        let _ = a.now_ns();
        let b = get(42);
        assert!(!Arc::ptr_eq(&a, &b));
        remove(42);
    }

    // One sequential test for everything that depends on helper lock state
    // or the global enable flag; parallel siblings would race on those.
    #[test]
    fn helper_lock_fallback_and_floor() {
        let clock = get(43);
        let helper = FakeHelper::new(5_000_000_000, false);
        clock.set_helper(Some(helper.clone()));

        // Unlocked helper: transparent local fallback.
        assert!(!clock.is_locked());
        assert_eq!(clock.offset_ns(), 0);

        helper.locked.store(true, Ordering::SeqCst);
        assert!(clock.is_locked());
        assert_eq!(clock.offset_ns(), -1500);
        assert_eq!(clock.master_id().as_deref(), Some("00-1B-21-AC-B5-4F"));

        let high = clock.now_ns();
        assert!(high >= 5_000_000_000);

        // Helper resyncs backwards; published time must hold its floor.
        helper.now.store(10, Ordering::SeqCst);
        assert!(clock.now_ns() >= high);

        // Globally disabled, every handle behaves as the local clock, and
        // the floor still holds.
        set_registry_enabled(false);
        assert!(!clock.is_locked());
        assert_eq!(clock.offset_ns(), 0);
        assert!(clock.now_ns() >= high);
        set_registry_enabled(true);

        // Losing lock falls back to local time, still never below the floor.
        helper.locked.store(false, Ordering::SeqCst);
        assert!(clock.now_ns() >= high);
        remove(43);
    }

    #[test]
    fn negative_domain_is_local() {
        let clock = get(-1);
        assert!(!clock.is_locked());
        // Installing a helper on the local domain has no effect.
        clock.set_helper(Some(FakeHelper::new(99, true)));
        assert!(!clock.is_locked());
        clock.set_helper(None);
    }
}
