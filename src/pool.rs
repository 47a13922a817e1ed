//! Per-physical-device voice admission and the process-wide pool registry.
//!
//! A device has a fixed number of simultaneously creatable voices. This module
//! splits that capacity into a "hardware" and a "software" budget and hands
//! out admissions against atomic counters, independent of how many buffer
//! objects exist. One [`DevicePool`] exists per distinct device identity; the
//! [`PoolRegistry`] serializes find-or-create so two threads asking for the
//! same device never open it twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::backend::{BackendDriver, BackendExtensions, DeviceIdentity, StreamingBackend};
use crate::error::{DsError, Result};

/// Fixed ceiling on the hardware-voice budget regardless of device capacity.
pub const HARDWARE_VOICE_CEILING: u32 = 64;
/// A device reporting fewer total voices than this is unusable.
pub const MIN_REQUIRED_VOICES: u32 = 4;

/// Which budget a voice admission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Hardware,
    Software,
}

/// Owns the backend connection for one physical device and enforces the
/// hardware/software voice ceilings.
pub struct DevicePool {
    identity: DeviceIdentity,
    registry: Weak<PoolRegistry>,
    backend: Mutex<Box<dyn StreamingBackend>>,
    extensions: BackendExtensions,
    max_hardware: u32,
    max_software: u32,
    hw_live: AtomicU32,
    sw_live: AtomicU32,
}

impl DevicePool {
    fn create(
        identity: DeviceIdentity,
        registry: Weak<PoolRegistry>,
        backend: Box<dyn StreamingBackend>,
    ) -> Result<Arc<Self>> {
        let total = backend.voice_capacity();
        if total < MIN_REQUIRED_VOICES {
            return Err(DsError::Backend(format!(
                "device reports {total} voices, need at least {MIN_REQUIRED_VOICES}"
            )));
        }
        let max_hardware = (total / 2).min(HARDWARE_VOICE_CEILING);
        let max_software = total - max_hardware;
        let extensions = backend.extensions();
        debug!(
            device = identity.name(),
            total, max_hardware, max_software, "device pool created"
        );
        Ok(Arc::new(Self {
            identity,
            registry,
            backend: Mutex::new(backend),
            extensions,
            max_hardware,
            max_software,
            hw_live: AtomicU32::new(0),
            sw_live: AtomicU32::new(0),
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn extensions(&self) -> BackendExtensions {
        self.extensions
    }

    pub fn max_voices(&self, class: Location) -> u32 {
        match class {
            Location::Hardware => self.max_hardware,
            Location::Software => self.max_software,
        }
    }

    pub fn live_voices(&self, class: Location) -> u32 {
        self.counter(class).load(Ordering::Acquire)
    }

    /// Try to reserve one voice slot. On failure nothing changes and the
    /// caller may retry later.
    pub fn try_admit(&self, class: Location) -> bool {
        let max = self.max_voices(class);
        let admitted = self
            .counter(class)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            debug!(device = self.identity.name(), ?class, max, "voice admission refused");
        }
        admitted
    }

    /// Return one previously admitted slot. Called exactly once per admitted
    /// voice; a stray release is clamped rather than underflowing.
    pub fn release(&self, class: Location) {
        let underflow = self
            .counter(class)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        if underflow {
            warn!(device = self.identity.name(), ?class, "voice release without admission");
        }
    }

    fn counter(&self, class: Location) -> &AtomicU32 {
        match class {
            Location::Hardware => &self.hw_live,
            Location::Software => &self.sw_live,
        }
    }

    /// The device's backend connection. Lock order: device state first, then
    /// this; never held across a registry operation.
    pub(crate) fn backend(&self) -> MutexGuard<'_, Box<dyn StreamingBackend>> {
        self.backend.lock().unwrap()
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut pools = registry.pools.lock().unwrap();
            // Only erase our own (now dead) entry; a concurrent reopen may
            // already have replaced it.
            if let Some(PoolEntry::Ready(weak)) = pools.get(&self.identity) {
                if weak.upgrade().is_none() {
                    pools.remove(&self.identity);
                }
            }
        }
    }
}

enum PoolEntry {
    /// Reserved by an opening thread; the backend open is in flight.
    Pending(Arc<PendingOpen>),
    Ready(Weak<DevicePool>),
}

struct PendingOpen {
    outcome: Mutex<Option<Result<Arc<DevicePool>>>>,
    done: Condvar,
}

impl PendingOpen {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Result<Arc<DevicePool>>) {
        *self.outcome.lock().unwrap() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Arc<DevicePool>> {
        let mut guard = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self.done.wait(guard).unwrap();
        }
    }
}

/// Process-wide device-pool registry.
///
/// Explicit service object rather than ambient global state: callers hold an
/// `Arc<PoolRegistry>` and inject it into device construction, which is what
/// lets the test suite run against a fake driver.
pub struct PoolRegistry {
    driver: Arc<dyn BackendDriver>,
    pools: Mutex<HashMap<DeviceIdentity, PoolEntry>>,
}

impl PoolRegistry {
    pub fn new(driver: Arc<dyn BackendDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Find the pool for `identity`, opening the device if no live pool
    /// exists.
    ///
    /// The registry mutex is held only for map access. An inserting thread
    /// reserves the identity with a pending entry, opens the device with the
    /// lock released, then publishes the pool (or erases the reservation on
    /// failure) and wakes every waiter. Waiters observe the single shared
    /// outcome; they never race to open the device themselves.
    pub fn get_or_open(self: &Arc<Self>, identity: &DeviceIdentity) -> Result<Arc<DevicePool>> {
        loop {
            let pending = {
                let mut pools = self.pools.lock().unwrap();
                match pools.get(identity) {
                    Some(PoolEntry::Ready(weak)) => {
                        if let Some(pool) = weak.upgrade() {
                            return Ok(pool);
                        }
                        // The last owner dropped between our lookup and its
                        // Drop-side erase; treat as vacant.
                        pools.remove(identity);
                        None
                    }
                    Some(PoolEntry::Pending(pending)) => Some(Arc::clone(pending)),
                    None => None,
                }
            };

            match pending {
                // Someone else is opening this device; share its outcome.
                Some(pending) => return pending.wait(),
                None => {
                    let pending = Arc::new(PendingOpen::new());
                    {
                        let mut pools = self.pools.lock().unwrap();
                        // Re-check: another thread may have reserved while we
                        // were unlocked.
                        if pools.contains_key(identity) {
                            continue;
                        }
                        pools.insert(identity.clone(), PoolEntry::Pending(Arc::clone(&pending)));
                    }

                    let outcome = self.open_pool(identity);
                    {
                        let mut pools = self.pools.lock().unwrap();
                        match &outcome {
                            Ok(pool) => {
                                pools.insert(
                                    identity.clone(),
                                    PoolEntry::Ready(Arc::downgrade(pool)),
                                );
                            }
                            // Failed opens leave no trace.
                            Err(_) => {
                                pools.remove(identity);
                            }
                        }
                    }
                    pending.publish(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    /// Heavy path: device open + context creation + capability query. Runs
    /// with no registry lock held.
    fn open_pool(self: &Arc<Self>, identity: &DeviceIdentity) -> Result<Arc<DevicePool>> {
        let backend = self
            .driver
            .open(identity)
            .map_err(|err| DsError::NoDriver(err.to_string()))?;
        DevicePool::create(identity.clone(), Arc::downgrade(self), backend)
    }

    /// Number of live pools (diagnostics/tests).
    ///
    /// Upgraded pools are collected first and only dropped after the map lock
    /// is released: dropping the final `Arc<DevicePool>` runs the pool's
    /// Drop-side erase, which takes the same lock.
    pub fn live_pools(&self) -> usize {
        let live: Vec<Arc<DevicePool>> = {
            let pools = self.pools.lock().unwrap();
            pools
                .values()
                .filter_map(|entry| match entry {
                    PoolEntry::Ready(weak) => weak.upgrade(),
                    PoolEntry::Pending(_) => None,
                })
                .collect()
        };
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDriver;

    #[test]
    fn ceiling_policy_splits_capacity() {
        let driver = FakeDriver::new(32);
        let registry = PoolRegistry::new(driver);
        let pool = registry.get_or_open(&DeviceIdentity::default_output()).unwrap();
        assert_eq!(pool.max_voices(Location::Hardware), 16);
        assert_eq!(pool.max_voices(Location::Software), 16);
    }

    #[test]
    fn ceiling_policy_caps_hardware_budget() {
        let driver = FakeDriver::new(256);
        let registry = PoolRegistry::new(driver);
        let pool = registry.get_or_open(&DeviceIdentity::default_output()).unwrap();
        assert_eq!(pool.max_voices(Location::Hardware), HARDWARE_VOICE_CEILING);
        assert_eq!(pool.max_voices(Location::Software), 256 - HARDWARE_VOICE_CEILING);
    }

    #[test]
    fn too_few_voices_fails_pool_creation() {
        let driver = FakeDriver::new(2);
        let registry = PoolRegistry::new(driver);
        assert!(registry.get_or_open(&DeviceIdentity::default_output()).is_err());
        assert_eq!(registry.live_pools(), 0);
    }

    #[test]
    fn admission_respects_ceiling_and_release_frees_one_slot() {
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(driver);
        let pool = registry.get_or_open(&DeviceIdentity::default_output()).unwrap();

        let max = pool.max_voices(Location::Hardware);
        for _ in 0..max {
            assert!(pool.try_admit(Location::Hardware));
        }
        assert!(!pool.try_admit(Location::Hardware));
        assert_eq!(pool.live_voices(Location::Hardware), max);

        pool.release(Location::Hardware);
        assert!(pool.try_admit(Location::Hardware));
        assert!(!pool.try_admit(Location::Hardware));
    }

    #[test]
    fn release_never_underflows() {
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(driver);
        let pool = registry.get_or_open(&DeviceIdentity::default_output()).unwrap();
        pool.release(Location::Software);
        assert_eq!(pool.live_voices(Location::Software), 0);
    }

    #[test]
    fn same_identity_yields_same_pool_and_one_open() {
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(Arc::clone(&driver) as _);
        let id = DeviceIdentity::new("card0");
        let a = registry.get_or_open(&id).unwrap();
        let b = registry.get_or_open(&id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(driver.open_count(), 1);
    }

    #[test]
    fn failed_open_leaves_no_trace_and_is_retryable() {
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(Arc::clone(&driver) as _);
        let id = DeviceIdentity::new("card0");

        driver.fail_next_opens(true);
        assert!(registry.get_or_open(&id).is_err());
        assert_eq!(registry.live_pools(), 0);

        driver.fail_next_opens(false);
        assert!(registry.get_or_open(&id).is_ok());
    }

    #[test]
    fn live_pool_count_survives_concurrent_teardown() {
        // Counting must never hold the final reference to a pool while the
        // registry map is locked; the churn thread keeps handing the counter
        // that chance.
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(Arc::clone(&driver) as _);
        let id = DeviceIdentity::new("card0");

        let churn = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let pool = registry.get_or_open(&id).unwrap();
                    drop(pool);
                }
            })
        };
        for _ in 0..500 {
            assert!(registry.live_pools() <= 1);
        }
        churn.join().unwrap();
        assert_eq!(registry.live_pools(), 0);
    }

    #[test]
    fn dropping_the_last_owner_erases_the_entry() {
        let driver = FakeDriver::new(8);
        let registry = PoolRegistry::new(Arc::clone(&driver) as _);
        let id = DeviceIdentity::new("card0");
        let pool = registry.get_or_open(&id).unwrap();
        drop(pool);
        assert_eq!(registry.live_pools(), 0);
        // Reopening after teardown works and opens the device again.
        let _pool = registry.get_or_open(&id).unwrap();
        assert_eq!(driver.open_count(), 2);
    }
}
