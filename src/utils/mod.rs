use crate::vm::Stop;
use std::future::pending;
use std::sync::{Mutex, MutexGuard};

pub mod process;

/// Locks `m`, a poisoned lock is still usable for plain buffers.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once the stop signal reads `true`, never if there is none or its sender is gone.
pub async fn stopped(stop: &mut Option<Stop>) {
    if let Some(rx) = stop.as_mut() {
        loop {
            let stop_req = *rx.borrow_and_update();
            if stop_req {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    pending::<()>().await
}

/// Index of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::watch;

    #[test]
    fn find_needle() {
        assert_eq!(find(b"abc executing program\n", b"executing program"), Some(4));
        assert_eq!(find(b"abc", b"abcd"), None);
        assert!(contains(b"x SYZ-FUZZER: PREEMPTED\n", b"SYZ-FUZZER: PREEMPTED"));
        assert!(!contains(b"", b"BUG:"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fires() {
        let (tx, rx) = watch::channel(false);
        let mut stop = Some(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(true);
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        stopped(&mut stop).await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_stop_never_fires() {
        let mut stop = None;
        let r = tokio::time::timeout(Duration::from_secs(60), stopped(&mut stop)).await;
        assert!(r.is_err());

        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut stop = Some(rx);
        let r = tokio::time::timeout(Duration::from_secs(60), stopped(&mut stop)).await;
        assert!(r.is_err());
    }
}
