//! Cross-process spinlock.
//!
//! The lock is a single `u32` inside the zone. Zero means unlocked, any other value is
//! the [`OwnerId`] (process id) of the holder. Because the holder is recorded, a waiter
//! that has been spinning for a while can check whether the holder still exists and
//! clear the word if it does not, so a worker killed inside a critical section does not
//! wedge every other worker.

use core::hint;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU32, Ordering};
use std::fmt;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};

use crate::error::ZoneError;

const UNLOCKED: u32 = 0;

/// Identity of a lock holder, normally a process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(NonZeroU32);

impl OwnerId {
    /// Wrap a raw id, `None` for zero.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The calling process.
    pub fn current() -> Self {
        let pid = getpid().as_raw() as u32;
        Self(NonZeroU32::new(pid).unwrap_or(NonZeroU32::MIN))
    }

    /// The raw id stored in the lock word.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner {}", self.0)
    }
}

/// Tells whether a lock holder is still running.
pub trait OwnerProbe: Send + Sync {
    /// `false` only when the owner is known to be gone.
    fn is_alive(&self, owner: OwnerId) -> bool;
}

/// Probes process ids with signal 0, counting zombies as dead.
///
/// A worker that exits holding the lock stays a zombie until its parent reaps it,
/// and signal 0 still reaches a zombie, so the process state is read as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl OwnerProbe for ProcessProbe {
    fn is_alive(&self, owner: OwnerId) -> bool {
        let Ok(raw) = i32::try_from(owner.get()) else {
            return false;
        };
        // EPERM still means the process exists
        if matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)) {
            return false;
        }
        !matches!(process_state(raw), Some('Z' | 'X'))
    }
}

/// State letter from `/proc/<pid>/stat`, if procfs is there to ask.
fn process_state(pid: i32) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_state(&stat)
}

// the command name may itself contain spaces and parentheses
fn parse_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// How long and how hard to spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Compare-and-swap attempts between voluntary yields
    pub max_spins: u32,
    /// Waiting time after which the holder's liveness is checked, and between checks
    pub stale_after: Duration,
    /// Give up after this long if the holder is alive
    pub timeout: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            max_spins: 512,
            stale_after: Duration::from_millis(20),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Result of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Acquired {
    /// A dead holder whose lock was cleared on the way in
    pub recovered: Option<OwnerId>,
}

/// A lock word living in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    /// Use `word` as a lock. Zero is unlocked.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// The current holder, if any.
    pub fn holder(&self) -> Option<OwnerId> {
        OwnerId::new(self.word.load(Ordering::Acquire))
    }

    /// Single attempt. On failure returns the holder observed.
    pub fn try_acquire(&self, owner: OwnerId) -> Result<(), Option<OwnerId>> {
        self.word
            .compare_exchange(UNLOCKED, owner.get(), Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(OwnerId::new)
    }

    /// Spin until the lock is taken by `owner`.
    ///
    /// Not reentrant: acquiring again with a lock already held by this process waits
    /// until `policy.timeout` and fails, since a live holder is never evicted.
    pub fn acquire(
        &self,
        owner: OwnerId,
        policy: &SpinPolicy,
        probe: &dyn OwnerProbe,
    ) -> Result<Acquired, ZoneError> {
        let started = Instant::now();
        let mut probed_at = started;
        let mut acquired = Acquired::default();

        loop {
            for _ in 0..policy.max_spins.max(1) {
                if self.word.load(Ordering::Relaxed) == UNLOCKED && self.try_acquire(owner).is_ok()
                {
                    return Ok(acquired);
                }
                hint::spin_loop();
            }
            thread::yield_now();

            let now = Instant::now();
            if now.duration_since(probed_at) >= policy.stale_after {
                probed_at = now;
                if let Some(holder) = self.holder() {
                    if holder != owner && !probe.is_alive(holder) {
                        if self.force_clear(holder) {
                            tracing::warn!(%holder, %owner, "recovered zone lock from a dead holder");
                            acquired.recovered = Some(holder);
                        }
                        continue;
                    }
                }
            }

            if now.duration_since(started) >= policy.timeout {
                let holder = self.holder().unwrap_or(owner);
                return Err(ZoneError::LockTimeout(holder));
            }
        }
    }

    /// Release a lock held by `owner`.
    pub fn release(&self, owner: OwnerId) -> Result<(), ZoneError> {
        self.word
            .compare_exchange(owner.get(), UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|actual| ZoneError::NotOwner {
                owner,
                holder: OwnerId::new(actual),
            })
    }

    /// Clear the word only if it still names `stale`.
    fn force_clear(&self, stale: OwnerId) -> bool {
        self.word
            .compare_exchange(stale.get(), UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    struct Alive;
    impl OwnerProbe for Alive {
        fn is_alive(&self, _: OwnerId) -> bool {
            true
        }
    }

    struct Dead;
    impl OwnerProbe for Dead {
        fn is_alive(&self, _: OwnerId) -> bool {
            false
        }
    }

    fn owner(raw: u32) -> OwnerId {
        OwnerId::new(raw).unwrap()
    }

    fn quick() -> SpinPolicy {
        SpinPolicy {
            max_spins: 16,
            stale_after: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn acquire_and_release() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        let a = owner(10);

        assert_eq!(lock.acquire(a, &quick(), &Alive).unwrap(), Acquired::default());
        assert_eq!(lock.holder(), Some(a));
        assert_eq!(lock.try_acquire(owner(11)), Err(Some(a)));
        lock.release(a).unwrap();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn only_the_holder_releases() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        lock.try_acquire(owner(1)).unwrap();

        let err = lock.release(owner(2)).unwrap_err();
        assert!(matches!(err, ZoneError::NotOwner { holder: Some(h), .. } if h == owner(1)));
        assert_eq!(lock.holder(), Some(owner(1)));

        lock.release(owner(1)).unwrap();
        assert!(matches!(
            lock.release(owner(1)),
            Err(ZoneError::NotOwner { holder: None, .. })
        ));
    }

    #[test]
    fn live_holder_times_out() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        lock.try_acquire(owner(1)).unwrap();

        let started = Instant::now();
        let err = lock.acquire(owner(2), &quick(), &Alive).unwrap_err();
        assert!(matches!(err, ZoneError::LockTimeout(h) if h == owner(1)));
        assert!(started.elapsed() >= quick().timeout);
    }

    #[test]
    fn dead_holder_is_evicted() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        lock.try_acquire(owner(1)).unwrap();

        let acquired = lock.acquire(owner(2), &quick(), &Dead).unwrap();
        assert_eq!(acquired.recovered, Some(owner(1)));
        assert_eq!(lock.holder(), Some(owner(2)));
    }

    #[test]
    fn own_id_is_never_evicted() {
        let word = AtomicU32::new(0);
        let lock = SpinLock::new(&word);
        lock.try_acquire(owner(3)).unwrap();
        assert!(matches!(
            lock.acquire(owner(3), &quick(), &Dead),
            Err(ZoneError::LockTimeout(_))
        ));
    }

    #[test]
    fn this_process_is_alive() {
        assert!(ProcessProbe.is_alive(OwnerId::current()));
    }

    #[test]
    fn state_follows_the_last_parenthesis() {
        assert_eq!(parse_state("4242 (worker) Z 1 4242 4242 0 -1"), Some('Z'));
        assert_eq!(parse_state("17 (a) b (c)) S 1 17"), Some('S'));
        assert_eq!(parse_state("17 (truncated"), None);
        assert_eq!(parse_state("17 (x)"), None);
    }

    #[test]
    fn own_state_is_not_zombie() {
        let state = process_state(std::process::id() as i32);
        assert!(matches!(state, Some('R' | 'S' | 'D')), "{state:?}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn at_most_one_holder(threads in 2usize..6, rounds in 1usize..200, hold_spins in 0u32..64) {
            let word = Arc::new(AtomicU32::new(0));
            let inside = Arc::new(AtomicBool::new(false));
            let counter = Arc::new(AtomicU64::new(0));
            let policy = SpinPolicy { timeout: Duration::from_secs(10), ..SpinPolicy::default() };

            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let (word, inside, counter) = (word.clone(), inside.clone(), counter.clone());
                    thread::spawn(move || {
                        let lock = SpinLock::new(&word);
                        let me = owner(t as u32 + 100);
                        for round in 0..rounds {
                            lock.acquire(me, &policy, &Alive).unwrap();
                            assert!(!inside.swap(true, Ordering::SeqCst), "two holders");
                            // non-atomic read-modify-write: lost updates show up in the total
                            let seen = counter.load(Ordering::Relaxed);
                            for _ in 0..(hold_spins + round as u32 % 7) {
                                hint::spin_loop();
                            }
                            if round % 5 == 0 {
                                thread::yield_now();
                            }
                            counter.store(seen + 1, Ordering::Relaxed);
                            inside.store(false, Ordering::SeqCst);
                            lock.release(me).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            prop_assert_eq!(counter.load(Ordering::SeqCst), (threads * rounds) as u64);
            prop_assert_eq!(word.load(Ordering::SeqCst), 0);
        }
    }
}
