//! Interval timers with stale-dispatch protection
//!
//! Callbacks live in a fixed-capacity handle pool. A dispatch identifies its
//! target by `(descriptor << 8) | index` packed into one integer; destroying
//! or reusing a handle bumps the slot's descriptor, so a dispatch that was
//! already in flight when the timer died no longer matches and is dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Result, VermeerError};

/// Capacity of the callback-handle pool; the index must fit one byte
pub const MAX_CALLBACK_HANDLES: usize = 64;

/// Descriptors wrap below 2^24 so the packed token fits a `u32`
const MAX_DESCRIPTOR_VALUE: u32 = 1 << 24;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct CallbackHandle {
    in_use: AtomicBool,
    descriptor: AtomicU32,
    callback: Mutex<Option<Callback>>,
}

impl CallbackHandle {
    const fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            descriptor: AtomicU32::new(0),
            callback: Mutex::new(None),
        }
    }

    fn increment_descriptor(&self) {
        let mut descriptor = self.descriptor.load(Ordering::Relaxed);
        descriptor += 1;
        if descriptor >= MAX_DESCRIPTOR_VALUE {
            descriptor = 0;
        }
        self.descriptor.store(descriptor, Ordering::Relaxed);
    }
}

const EMPTY_HANDLE: CallbackHandle = CallbackHandle::new();
static CALLBACK_HANDLES: [CallbackHandle; MAX_CALLBACK_HANDLES] =
    [EMPTY_HANDLE; MAX_CALLBACK_HANDLES];

fn pack_token(index: u8, descriptor: u32) -> u32 {
    debug_assert!(descriptor < MAX_DESCRIPTOR_VALUE);
    (descriptor << 8) | index as u32
}

fn token_index(token: u32) -> u8 {
    (token & 0xFF) as u8
}

fn token_descriptor(token: u32) -> u32 {
    (token >> 8) & 0xFF_FFFF
}

/// Invoke the callback a token refers to, unless the token is stale
fn dispatch(token: u32) {
    let index = token_index(token) as usize;
    if index >= MAX_CALLBACK_HANDLES {
        return;
    }
    let handle = &CALLBACK_HANDLES[index];
    if !handle.in_use.load(Ordering::Acquire) {
        return;
    }
    if handle.descriptor.load(Ordering::Relaxed) != token_descriptor(token) {
        // The handle was destroyed or reused after this dispatch was queued
        log::debug!("dropping stale timer dispatch for slot {}", index);
        return;
    }
    let callback = handle.callback.lock().unwrap().clone();
    if let Some(callback) = callback {
        // Re-check under no lock: destruction between clone and call is
        // tolerated, the callback owner must outlive its side effects anyway
        if handle.descriptor.load(Ordering::Relaxed) == token_descriptor(token) {
            callback();
        }
    }
}

/// A recurring timer firing a callback every `interval`
pub struct IntervalTimer {
    index: u8,
    interval: Duration,
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl IntervalTimer {
    /// Claim a handle slot and start ticking
    pub fn start<F>(interval: Duration, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(VermeerError::invalid_parameter(
                "interval",
                "Timer interval must be non-zero",
            ));
        }

        let mut claimed = None;
        for (index, handle) in CALLBACK_HANDLES.iter().enumerate() {
            if handle
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                claimed = Some(index);
                break;
            }
        }
        let index = claimed.ok_or_else(|| VermeerError::pool_exhausted("timer callback handles"))?;

        let handle = &CALLBACK_HANDLES[index];
        handle.increment_descriptor();
        *handle.callback.lock().unwrap() = Some(Arc::new(callback));
        let token = pack_token(index as u8, handle.descriptor.load(Ordering::Relaxed));

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("vermeer-timer-{}", index))
            .spawn(move || {
                let (lock, condvar) = &*thread_stop;
                loop {
                    let stopped = lock.lock().unwrap();
                    let (stopped, _timeout) =
                        condvar.wait_timeout_while(stopped, interval, |s| !*s).unwrap();
                    if *stopped {
                        return;
                    }
                    drop(stopped);
                    dispatch(token);
                }
            })
            .map_err(|e| VermeerError::platform(format!("Failed to spawn timer thread: {}", e)))?;

        Ok(Self {
            index: index as u8,
            interval,
            stop,
            thread: Some(thread),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop ticking and release the handle slot
    pub fn stop(&mut self) {
        {
            let (lock, condvar) = &*self.stop;
            let mut stopped = lock.lock().unwrap();
            if *stopped {
                return;
            }
            *stopped = true;
            condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        let handle = &CALLBACK_HANDLES[self.index as usize];
        // Invalidate in-flight dispatches before the slot becomes reusable
        handle.increment_descriptor();
        *handle.callback.lock().unwrap() = None;
        handle.in_use.store(false, Ordering::Release);
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
