//! Lock ordering for the registry.
//!
//! Locks are always taken in ascending [`LockLevel`] order:
//!
//! 1. **Validation** serialises discovery and self-heal sandbox runs.
//! 2. **State** guards the record table and the per-planner lock map.
//! 3. **Planner** guards one candidate's live instance.
//!
//! Each registry operation carries its own [`LockLedger`]. Entering a level at or
//! below one the operation already holds panics, so an out-of-order acquisition
//! fails loudly the first time a test exercises it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    Validation = 1,
    State = 2,
    Planner = 3,
}

impl LockLevel {
    pub const fn name(self) -> &'static str {
        match self {
            LockLevel::Validation => "validation",
            LockLevel::State => "state",
            LockLevel::Planner => "planner",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Levels currently held by one logical operation, as a bitmask.
#[derive(Debug, Default)]
pub struct LockLedger {
    held: AtomicU8,
}

impl LockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `level` as held.
    ///
    /// # Panics
    ///
    /// Panics when a level greater than or equal to `level` is already held.
    pub fn enter(&self, level: LockLevel) -> LevelGuard<'_> {
        let held = self.held.load(Ordering::Acquire);
        let at_or_above = !(level.bit() - 1);
        assert!(
            held & at_or_above == 0,
            "lock order violation: acquiring {level} while holding {}",
            describe(held)
        );
        self.held.fetch_or(level.bit(), Ordering::AcqRel);
        LevelGuard {
            ledger: self,
            level,
        }
    }

    pub fn holds(&self, level: LockLevel) -> bool {
        self.held.load(Ordering::Acquire) & level.bit() != 0
    }
}

fn describe(held: u8) -> String {
    [LockLevel::Validation, LockLevel::State, LockLevel::Planner]
        .into_iter()
        .filter(|level| held & level.bit() != 0)
        .map(LockLevel::name)
        .collect::<Vec<_>>()
        .join("+")
}

#[derive(Debug)]
pub struct LevelGuard<'a> {
    ledger: &'a LockLedger,
    level: LockLevel,
}

impl Drop for LevelGuard<'_> {
    fn drop(&mut self) {
        self.ledger
            .held
            .fetch_and(!self.level.bit(), Ordering::AcqRel);
    }
}

/// Mutex guard that also occupies its level in the ledger until dropped.
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _level: LevelGuard<'a>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Acquires `mutex` at `level`, giving up after `limit`.
///
/// The ordering check runs before waiting, so a violation panics even when the
/// lock happens to be free.
pub async fn timed_lock<'a, T>(
    mutex: &'a Mutex<T>,
    ledger: &'a LockLedger,
    level: LockLevel,
    resource: &str,
    limit: Duration,
) -> RegistryResult<OrderedGuard<'a, T>> {
    let level_guard = ledger.enter(level);
    match timeout(limit, mutex.lock()).await {
        Ok(guard) => Ok(OrderedGuard {
            guard,
            _level: level_guard,
        }),
        Err(_) => Err(RegistryError::LockTimeout {
            resource: resource.to_string(),
            timeout_s: limit.as_secs_f64(),
        }),
    }
}
