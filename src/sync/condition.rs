//! Cross-process condition variable over a futex word
//!
//! The shared state is a generation counter and a bitset of notification
//! indices, all inside a shared segment. A notifier sets its index bit, bumps
//! the generation and wakes; a listener collects and clears fired bits or
//! sleeps on the generation word. Eventfds stay inside one process, so the
//! wake-up between processes has to go through the futex word itself.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::MAX_NOTIFICATION_INDICES;
use crate::error::{Result, VermeerError};
use crate::relative_ptr::{RelPtr, SegmentRegistry};

const BITSET_WORDS: usize = MAX_NOTIFICATION_INDICES / 64;

/// Shared-memory state of one condition variable
#[repr(C)]
pub struct ConditionVariableData {
    /// Wake generation; the futex word
    generation: AtomicU32,
    /// Set while tearing down so waiters return instead of re-sleeping
    to_be_destroyed: AtomicU32,
    /// One bit per notification index
    active: [AtomicU64; BITSET_WORDS],
}

impl ConditionVariableData {
    /// Initialise in place
    ///
    /// # Safety
    /// `data` must point to writable, properly aligned, otherwise unused
    /// memory.
    pub unsafe fn init(data: *mut ConditionVariableData) {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        data.write(ConditionVariableData {
            generation: AtomicU32::new(0),
            to_be_destroyed: AtomicU32::new(0),
            active: [ZERO; BITSET_WORDS],
        });
    }

    fn set(&self, index: u64) {
        let word = (index / 64) as usize;
        let bit = 1u64 << (index % 64);
        self.active[word].fetch_or(bit, Ordering::Release);
    }

    /// Collect and clear all fired indices
    fn collect(&self, fired: &mut Vec<u64>) {
        for (word_index, word) in self.active.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as u64;
                fired.push(word_index as u64 * 64 + bit);
                bits &= bits - 1;
            }
        }
    }

    /// Fire one index and wake waiters; the publish-side fast path
    pub fn post(&self, index: u64) {
        if index as usize >= MAX_NOTIFICATION_INDICES {
            return;
        }
        self.set(index);
        self.generation.fetch_add(1, Ordering::Release);
        futex_wake(&self.generation);
    }

    /// Mark for destruction and wake every waiter
    pub fn shutdown(&self) {
        self.to_be_destroyed.store(1, Ordering::Release);
        self.generation.fetch_add(1, Ordering::Release);
        futex_wake(&self.generation);
    }
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let timespec = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = timespec
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(std::ptr::null());
    unsafe {
        // Deliberately without FUTEX_PRIVATE_FLAG: waiter and waker can be
        // different processes mapping the same page.
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Fires one notification index of a condition variable
pub struct ConditionNotifier {
    data: RelPtr<ConditionVariableData>,
    index: u64,
    registry: Arc<SegmentRegistry>,
}

impl ConditionNotifier {
    pub fn new(
        data: RelPtr<ConditionVariableData>,
        index: u64,
        registry: Arc<SegmentRegistry>,
    ) -> Result<Self> {
        if index as usize >= MAX_NOTIFICATION_INDICES {
            return Err(VermeerError::invalid_parameter(
                "index",
                format!("Notification index must be below {}", MAX_NOTIFICATION_INDICES),
            ));
        }
        Ok(Self {
            data,
            index,
            registry,
        })
    }

    /// Set this notifier's bit and wake waiters
    pub fn notify(&self) {
        let data = unsafe { &*self.data.resolve(&self.registry) };
        data.set(self.index);
        data.generation.fetch_add(1, Ordering::Release);
        futex_wake(&data.generation);
    }
}

/// Waits on a condition variable and reports which indices fired
pub struct ConditionListener {
    data: RelPtr<ConditionVariableData>,
    registry: Arc<SegmentRegistry>,
}

impl ConditionListener {
    pub fn new(data: RelPtr<ConditionVariableData>, registry: Arc<SegmentRegistry>) -> Self {
        Self { data, registry }
    }

    pub fn condition(&self) -> RelPtr<ConditionVariableData> {
        self.data
    }

    /// Indices that fired since the last call, without blocking
    pub fn try_collect(&self) -> Vec<u64> {
        let data = unsafe { &*self.data.resolve(&self.registry) };
        let mut fired = Vec::new();
        data.collect(&mut fired);
        fired
    }

    /// Wait for at least one index to fire, with an optional timeout.
    ///
    /// Returns the fired indices; empty on timeout or shutdown.
    pub fn timed_wait(&self, timeout: Option<Duration>) -> Vec<u64> {
        let data = unsafe { &*self.data.resolve(&self.registry) };
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut fired = Vec::new();

        loop {
            data.collect(&mut fired);
            if !fired.is_empty() {
                return fired;
            }
            if data.to_be_destroyed.load(Ordering::Acquire) != 0 {
                return fired;
            }

            let generation = data.generation.load(Ordering::Acquire);
            // Re-check after reading the generation: a notify between collect
            // and the futex call changes the word and the wait returns
            // immediately.
            data.collect(&mut fired);
            if !fired.is_empty() {
                return fired;
            }

            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return fired;
                    }
                    Some(d - now)
                }
            };
            futex_wait(&data.generation, generation, remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Instant;

    fn setup() -> (Arc<SegmentRegistry>, Vec<u64>, RelPtr<ConditionVariableData>) {
        let registry = Arc::new(SegmentRegistry::new());
        let size = std::mem::size_of::<ConditionVariableData>() + 64;
        let mut backing = vec![0u64; size / 8 + 1];
        registry
            .register(1, backing.as_mut_ptr() as *mut u8, size)
            .unwrap();
        unsafe { ConditionVariableData::init(backing.as_mut_ptr() as *mut ConditionVariableData) };
        (registry, backing, RelPtr::new(1, 0))
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let (registry, _backing, data) = setup();
        let notifier = ConditionNotifier::new(data, 3, Arc::clone(&registry)).unwrap();
        let listener = ConditionListener::new(data, registry);

        notifier.notify();
        let fired = listener.timed_wait(Some(Duration::from_millis(100)));
        assert_eq!(fired, vec![3]);
    }

    #[test]
    fn test_timeout_returns_empty() {
        let (registry, _backing, data) = setup();
        let listener = ConditionListener::new(data, registry);

        let start = Instant::now();
        let fired = listener.timed_wait(Some(Duration::from_millis(50)));
        assert!(fired.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wakeup_across_threads() {
        let (registry, _backing, data) = setup();
        let barrier = Arc::new(Barrier::new(2));

        let notifier_registry = Arc::clone(&registry);
        let notifier_barrier = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || {
            let notifier = ConditionNotifier::new(data, 5, notifier_registry).unwrap();
            notifier_barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        let listener = ConditionListener::new(data, registry);
        barrier.wait();
        let fired = listener.timed_wait(Some(Duration::from_secs(5)));
        assert_eq!(fired, vec![5]);
        handle.join().unwrap();
    }

    #[test]
    fn test_multiple_indices_collected() {
        let (registry, _backing, data) = setup();
        let a = ConditionNotifier::new(data, 1, Arc::clone(&registry)).unwrap();
        let b = ConditionNotifier::new(data, 9, Arc::clone(&registry)).unwrap();
        let listener = ConditionListener::new(data, registry);

        a.notify();
        b.notify();
        let mut fired = listener.timed_wait(Some(Duration::from_millis(100)));
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 9]);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let (registry, _backing, data) = setup();
        assert!(
            ConditionNotifier::new(data, MAX_NOTIFICATION_INDICES as u64, registry).is_err()
        );
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let (registry, _backing, data) = setup();
        let listener_registry = Arc::clone(&registry);

        let handle = std::thread::spawn(move || {
            let listener = ConditionListener::new(data, listener_registry);
            listener.timed_wait(Some(Duration::from_secs(10)))
        });

        std::thread::sleep(Duration::from_millis(20));
        let cvd = unsafe { &*data.resolve(&registry) };
        cvd.shutdown();
        let fired = handle.join().unwrap();
        assert!(fired.is_empty());
    }
}
