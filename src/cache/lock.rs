//! Poison-tolerant lock acquisition.
//!
//! A panicking listener or fetcher must not wedge the whole engine, so every
//! lock in the crate is taken through these helpers, which log and recover.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    site: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, site, op, "rwlock.read"))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    site: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, site, op, "rwlock.write"))
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    site: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, site, op, "mutex.lock"))
}

fn recover<G>(
    poisoned: PoisonError<G>,
    site: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        site,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned engine lock"
    );
    poisoned.into_inner()
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_poisoned_mutex() {
        let lock = Mutex::new(1);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison");
        }));

        *mutex_lock(&lock, "test", "write") += 1;
        assert_eq!(*mutex_lock(&lock, "test", "read"), 2);
    }

    #[test]
    fn recovers_poisoned_rwlock() {
        let lock = RwLock::new(vec![1]);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison");
        }));

        write_lock(&lock, "test", "push").push(2);
        assert_eq!(read_lock(&lock, "test", "len").len(), 2);
    }
}
