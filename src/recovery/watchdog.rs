//! Per-vCPU liveness watchdog.
//!
//! The watchdog is polled, never preemptive: the run loop arms a deadline
//! before entering the guest and calls [`WatchdogTimer::check`] whenever it
//! regains control. Time is measured in CPU cycles from a [`CycleCounter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

/// Monotonic cycle source.
pub trait CycleCounter: Send + Sync {
    fn cycles(&self) -> u64;
}

/// Host monotonic clock scaled to a nominal cycle frequency.
pub struct MonotonicCycles {
    start: Instant,
    hz: u64,
}

impl MonotonicCycles {
    /// Nominal 1 GHz: one cycle per nanosecond.
    pub fn new() -> Self {
        Self::with_frequency(1_000_000_000)
    }

    pub fn with_frequency(hz: u64) -> Self {
        Self {
            start: Instant::now(),
            hz,
        }
    }
}

impl Default for MonotonicCycles {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for MonotonicCycles {
    fn cycles(&self) -> u64 {
        let nanos = self.start.elapsed().as_nanos();
        (nanos * self.hz as u128 / 1_000_000_000) as u64
    }
}

/// Clock advanced explicitly; used for deterministic replay and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::SeqCst);
    }

    pub fn set(&self, cycles: u64) {
        self.now.store(cycles, Ordering::SeqCst);
    }
}

impl CycleCounter for ManualClock {
    fn cycles(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Callback invoked once per expiry with the vCPU id and cycles overrun.
pub type TimeoutCallback = Box<dyn FnMut(u32, u64) + Send>;

#[derive(Debug, Clone, Copy)]
struct Deadline {
    armed_at: u64,
    timeout: u64,
    expired: bool,
}

/// Deadline tracker for every vCPU.
pub struct WatchdogTimer {
    clock: Arc<dyn CycleCounter>,
    deadlines: HashMap<u32, Deadline>,
    on_timeout: Option<TimeoutCallback>,
}

impl WatchdogTimer {
    pub fn new(clock: Arc<dyn CycleCounter>) -> Self {
        Self {
            clock,
            deadlines: HashMap::new(),
            on_timeout: None,
        }
    }

    pub fn set_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.on_timeout = Some(callback);
    }

    /// Arm (or re-arm) a deadline `timeout` cycles from now.
    pub fn arm(&mut self, vcpu: u32, timeout: u64) {
        let armed_at = self.clock.cycles();
        self.deadlines.insert(
            vcpu,
            Deadline {
                armed_at,
                timeout,
                expired: false,
            },
        );
    }

    pub fn disarm(&mut self, vcpu: u32) {
        self.deadlines.remove(&vcpu);
    }

    /// Restart the deadline with the same timeout. Returns false if unarmed.
    pub fn kick(&mut self, vcpu: u32) -> bool {
        let now = self.clock.cycles();
        match self.deadlines.get_mut(&vcpu) {
            Some(deadline) => {
                deadline.armed_at = now;
                deadline.expired = false;
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, vcpu: u32) -> bool {
        self.deadlines.contains_key(&vcpu)
    }

    /// Poll a vCPU's deadline.
    ///
    /// Returns false once the deadline has elapsed, and keeps returning false
    /// until the vCPU is kicked or re-armed. The callback fires on the first
    /// failing poll only. An unarmed vCPU is always ok.
    pub fn check(&mut self, vcpu: u32) -> bool {
        let now = self.clock.cycles();
        let Some(deadline) = self.deadlines.get_mut(&vcpu) else {
            return true;
        };
        let elapsed = now.saturating_sub(deadline.armed_at);
        if elapsed < deadline.timeout {
            return true;
        }
        if !deadline.expired {
            deadline.expired = true;
            let overrun = elapsed - deadline.timeout;
            warn!("watchdog expired on vCPU {} ({} cycles over)", vcpu, overrun);
            if let Some(callback) = self.on_timeout.as_mut() {
                callback(vcpu, overrun);
            }
        }
        false
    }

    /// Poll every armed vCPU, returning the ids that have expired.
    pub fn check_all(&mut self) -> Vec<u32> {
        let mut vcpus: Vec<u32> = self.deadlines.keys().copied().collect();
        vcpus.sort_unstable();
        vcpus.into_iter().filter(|&v| !self.check(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn watchdog() -> (WatchdogTimer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (WatchdogTimer::new(clock.clone()), clock)
    }

    #[test]
    fn test_unarmed_is_ok() {
        let (mut wd, _) = watchdog();
        assert!(wd.check(0));
    }

    #[test]
    fn test_expires_after_deadline() {
        let (mut wd, clock) = watchdog();
        wd.arm(0, 1000);
        clock.advance(999);
        assert!(wd.check(0));
        clock.advance(1);
        assert!(!wd.check(0));
        // Fails closed until kicked.
        assert!(!wd.check(0));
        assert!(wd.kick(0));
        assert!(wd.check(0));
    }

    #[test]
    fn test_callback_fires_once() {
        let (mut wd, clock) = watchdog();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        wd.set_timeout_callback(Box::new(move |vcpu, overrun| {
            sink.lock().unwrap().push((vcpu, overrun));
        }));
        wd.arm(2, 100);
        clock.advance(150);
        wd.check(2);
        wd.check(2);
        assert_eq!(*fired.lock().unwrap(), vec![(2, 50)]);
    }

    #[test]
    fn test_check_all_and_disarm() {
        let (mut wd, clock) = watchdog();
        wd.arm(0, 10);
        wd.arm(1, 1000);
        clock.advance(20);
        assert_eq!(wd.check_all(), vec![0]);
        wd.disarm(0);
        assert!(!wd.is_armed(0));
        assert!(!wd.kick(0));
        assert!(wd.check_all().is_empty());
    }

    #[test]
    fn test_monotonic_cycles_advance() {
        let clock = MonotonicCycles::new();
        let a = clock.cycles();
        let b = clock.cycles();
        assert!(b >= a);
    }
}
