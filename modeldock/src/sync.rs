//! Lock helpers that recover from poisoning.
//!
//! Registry and room maps are only touched in short, non-panicking critical
//! sections, so a poisoned lock still guards consistent data.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("rwlock was poisoned during read, recovering");
        poisoned.into_inner()
    })
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("rwlock was poisoned during write, recovering");
        poisoned.into_inner()
    })
}
