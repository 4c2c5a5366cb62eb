// iSECTECH Security Integrations - Timed Lock Acquisition
// Cancellable lock acquisition bounded by a timeout
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Lock helpers that fail with [`IntegrationError::Timeout`] instead of
//! blocking forever.
//!
//! The tokio lock futures are cancel-safe: when the timeout fires the pending
//! acquisition is dropped and removed from the wait queue, so nothing is left
//! holding or waiting on the lock afterwards.

use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{IntegrationError, Result};

/// Acquire a read guard within `timeout`
pub async fn read_with_timeout<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    resource: &str,
) -> Result<RwLockReadGuard<'a, T>> {
    tokio::time::timeout(timeout, lock.read())
        .await
        .map_err(|_| lock_timeout(resource, timeout))
}

/// Acquire a write guard within `timeout`
pub async fn write_with_timeout<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    resource: &str,
) -> Result<RwLockWriteGuard<'a, T>> {
    tokio::time::timeout(timeout, lock.write())
        .await
        .map_err(|_| lock_timeout(resource, timeout))
}

/// Acquire a mutex guard within `timeout`
pub async fn lock_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    resource: &str,
) -> Result<MutexGuard<'a, T>> {
    tokio::time::timeout(timeout, mutex.lock())
        .await
        .map_err(|_| lock_timeout(resource, timeout))
}

fn lock_timeout(resource: &str, timeout: Duration) -> IntegrationError {
    IntegrationError::Timeout(format!(
        "Failed to acquire {} lock within {:?}", resource, timeout
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_uncontended_acquisition() {
        let lock = RwLock::new(5);
        let guard = read_with_timeout(&lock, Duration::from_millis(10), "counter").await.unwrap();
        assert_eq!(*guard, 5);
    }

    #[tokio::test]
    async fn test_write_times_out_while_held() {
        let lock = RwLock::new(0);
        let _reader = lock.read().await;

        let err = write_with_timeout(&lock, Duration::from_millis(20), "counter").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("counter"));
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_hold_lock() {
        let mutex = Mutex::new(Vec::<u32>::new());
        {
            let _held = mutex.lock().await;
            assert!(lock_with_timeout(&mutex, Duration::from_millis(10), "buffer").await.is_err());
        }
        // The abandoned acquisition must not linger as an owner or waiter
        let mut guard = lock_with_timeout(&mutex, Duration::from_millis(10), "buffer").await.unwrap();
        guard.push(1);
        assert_eq!(guard.len(), 1);
    }
}
