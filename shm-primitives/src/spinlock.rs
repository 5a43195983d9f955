//! A single 32-byte spinlock state shared by two acquisition modes:
//!
//! - **PID/TID mode**, for cross-process mutual exclusion (e.g. the
//!   DataBlock flexible-zone lock): acquisition CASes `pid` from 0 to the
//!   caller's OS PID, `tid` records the owning thread for same-thread
//!   reentrancy, and a zombie owner (PID no longer alive) is reclaimed with
//!   a single CAS.
//! - **Token mode**, for in-process handoff between tasks/threads that don't
//!   want to pay for a PID liveness check: acquisition CASes `token` from 0
//!   to a process-unique nonzero value chosen by the caller. The guard
//!   carries that token and can be moved across threads.
//!
//! Both modes share one layout so a single spinlock can, over its lifetime,
//! serve either acquisition style — the struct itself doesn't record which
//! mode is "in force"; that's a convention enforced by the call site (the
//! DataBlock header always uses PID/TID mode for `flexzone_spinlock`).

use core::time::Duration;

use crate::sync::{AtomicU32, AtomicU64, Ordering};

use crate::pid;

/// Spin for up to this many iterations before falling back to sleeping.
/// Doubles each failed attempt, capped here.
const SPIN_ITERATIONS_MAX: u32 = 1024;

/// Upper bound on the `sleep_for` backoff between spin bursts.
const SLEEP_CAP: Duration = Duration::from_millis(4);

/// The 32-byte spinlock state. Lives directly embedded in shared memory
/// (e.g. as `Header::flexzone_spinlock`).
#[repr(C, align(8))]
pub struct Spinlock {
    /// Owning process PID in PID/TID mode; 0 when free.
    pid: AtomicU64,
    /// Owning thread id in PID/TID mode (diagnostic + reentrancy key).
    tid: AtomicU64,
    /// Handoff token in token mode; also doubles as a release generation
    /// counter in PID/TID mode (bumped on every unlock).
    token: AtomicU64,
    /// Same-thread reentrancy counter (PID/TID mode only).
    recursion_count: AtomicU32,
    _pad: [u8; 4],
}

const _: () = assert!(core::mem::size_of::<Spinlock>() == 32);

impl Spinlock {
    /// A statically-initialized, unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            pid: AtomicU64::new(0),
            tid: AtomicU64::new(0),
            token: AtomicU64::new(0),
            recursion_count: AtomicU32::new(0),
            _pad: [0; 4],
        }
    }

    /// Reset to the unlocked state. Only safe when no participant holds (or
    /// believes it holds) this lock — used during segment creation and by
    /// administrative force-reset.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access: no other thread/process may
    /// be concurrently acquiring or releasing this lock.
    pub unsafe fn force_reset(&self) {
        self.pid.store(0, Ordering::Release);
        self.tid.store(0, Ordering::Release);
        self.token.store(0, Ordering::Release);
        self.recursion_count.store(0, Ordering::Release);
    }

    /// The PID currently holding the lock in PID/TID mode, or 0 if free.
    pub fn holder_pid(&self) -> u64 {
        self.pid.load(Ordering::Acquire)
    }

    // -- PID/TID mode --------------------------------------------------

    /// Acquire in PID/TID mode, spinning with exponential backoff and
    /// reclaiming a zombie owner, until `timeout` elapses.
    #[cfg(feature = "std")]
    pub fn lock_pid_tid(&self, timeout: Duration) -> Result<SpinlockGuard<'_>, LockTimeout> {
        let my_pid = pid::current_pid() as u64;
        let my_tid = pid::current_tid() as u64;
        let deadline = std::time::Instant::now() + timeout;
        let mut spins: u32 = 1;

        loop {
            let held_pid = self.pid.load(Ordering::Acquire);

            if held_pid == my_pid && self.tid.load(Ordering::Acquire) == my_tid {
                // Reentrant acquisition by the same thread.
                self.recursion_count.fetch_add(1, Ordering::AcqRel);
                return Ok(SpinlockGuard {
                    lock: self,
                    mode: GuardMode::PidTid,
                });
            }

            if held_pid == 0 {
                if self
                    .pid
                    .compare_exchange(0, my_pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.tid.store(my_tid, Ordering::Release);
                    self.recursion_count.store(1, Ordering::Release);
                    return Ok(SpinlockGuard {
                        lock: self,
                        mode: GuardMode::PidTid,
                    });
                }
            } else if !pid::is_alive(held_pid as u32) {
                // Zombie owner: attempt a single CAS reclaim, then retry
                // the loop (don't assume we won the reclaim race).
                if self
                    .pid
                    .compare_exchange(held_pid, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(pid = held_pid, "orphan_writer_reclaimed: spinlock owner dead");
                    self.tid.store(0, Ordering::Release);
                    self.recursion_count.store(0, Ordering::Release);
                }
                continue;
            }

            if std::time::Instant::now() >= deadline {
                return Err(LockTimeout);
            }

            backoff(&mut spins);
        }
    }

    fn unlock_pid_tid(&self) {
        let remaining = self.recursion_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.token.fetch_add(1, Ordering::Release);
            self.tid.store(0, Ordering::Release);
            self.pid.store(0, Ordering::Release);
        }
    }

    // -- Token mode ------------------------------------------------------

    /// Acquire in token mode: CAS `token` from 0 to `my_token` (which must be
    /// nonzero and unique to the caller for the duration of the hold).
    #[cfg(feature = "std")]
    pub fn lock_token(&self, my_token: u64, timeout: Duration) -> Result<SpinlockGuard<'_>, LockTimeout> {
        debug_assert_ne!(my_token, 0, "token mode requires a nonzero token");
        let deadline = std::time::Instant::now() + timeout;
        let mut spins: u32 = 1;

        loop {
            if let Some(guard) = self.try_lock_token(my_token) {
                return Ok(guard);
            }

            if std::time::Instant::now() >= deadline {
                return Err(LockTimeout);
            }

            backoff(&mut spins);
        }
    }

    fn unlock_token(&self, my_token: u64) {
        let _ = self
            .token
            .compare_exchange(my_token, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Single-attempt, non-blocking token acquisition — no spinning, no
    /// timeout, no clock. Used by the blocking `lock_token` internally and
    /// directly by callers (e.g. loom model tests) that want to drive their
    /// own retry loop without a wall-clock deadline.
    pub fn try_lock_token(&self, my_token: u64) -> Option<SpinlockGuard<'_>> {
        debug_assert_ne!(my_token, 0, "token mode requires a nonzero token");
        if self
            .token
            .compare_exchange(0, my_token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(SpinlockGuard {
                lock: self,
                mode: GuardMode::Token(my_token),
            })
        } else {
            None
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when a spinlock acquisition doesn't succeed within its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

impl core::fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "spinlock acquisition timed out")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LockTimeout {}

#[derive(Clone, Copy)]
enum GuardMode {
    PidTid,
    Token(u64),
}

/// RAII guard for [`Spinlock`]. Releases on drop unless [`SpinlockGuard::forget`]
/// is called. The drop path never panics.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
    mode: GuardMode,
}

impl<'a> SpinlockGuard<'a> {
    /// Release without running the normal unlock logic. Used when the
    /// caller has already reset the lock some other way (e.g. as part of
    /// a larger administrative force-reset) and a double-unlock would be
    /// wrong.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        match self.mode {
            GuardMode::PidTid => self.lock.unlock_pid_tid(),
            GuardMode::Token(t) => self.lock.unlock_token(t),
        }
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPIN_ITERATIONS_MAX {
        for _ in 0..*spins {
            core::hint::spin_loop();
        }
        *spins = (*spins * 2).min(SPIN_ITERATIONS_MAX);
    } else {
        #[cfg(feature = "std")]
        std::thread::sleep(SLEEP_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_pid_tid_roundtrip() {
        let lock = Spinlock::new();
        {
            let _g = lock.lock_pid_tid(Duration::from_millis(100)).unwrap();
            assert_eq!(lock.holder_pid(), pid::current_pid() as u64);
        }
        assert_eq!(lock.holder_pid(), 0);
    }

    #[test]
    fn reentrant_same_thread() {
        let lock = Spinlock::new();
        let g1 = lock.lock_pid_tid(Duration::from_millis(100)).unwrap();
        let g2 = lock.lock_pid_tid(Duration::from_millis(100)).unwrap();
        drop(g2);
        assert_eq!(lock.holder_pid(), pid::current_pid() as u64);
        drop(g1);
        assert_eq!(lock.holder_pid(), 0);
    }

    #[test]
    fn token_mode_roundtrip() {
        let lock = Spinlock::new();
        {
            let _g = lock.lock_token(0xdead_beef, Duration::from_millis(100)).unwrap();
            assert_eq!(lock.token.load(Ordering::Acquire), 0xdead_beef);
        }
        assert_eq!(lock.token.load(Ordering::Acquire), 0);
    }

    #[test]
    fn token_timeout_when_held() {
        let lock = Spinlock::new();
        let _g = lock.lock_token(1, Duration::from_millis(50)).unwrap();
        let result = lock.lock_token(2, Duration::from_millis(20));
        assert!(result.is_err());
    }
}
