//! 带超时的线程回收
//!
//! 标准库的 `JoinHandle::join` 没有超时。这里把 join 交给一个看守线程，
//! 调用方只等待有限时间；超时后看守线程与被回收线程一起泄漏。

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("thread did not exit within {0:?}")]
    Timeout(Duration),

    #[error("thread panicked")]
    Panicked,
}

/// `JoinHandle` 的限时 join
pub trait JoinTimeout<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, JoinError>;
}

impl<T: Send + 'static> JoinTimeout<T> for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, JoinError> {
        if self.is_finished() {
            return self.join().map_err(|_| JoinError::Panicked);
        }

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(self.join());
        });

        match done_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => Err(JoinError::Panicked),
            Err(RecvTimeoutError::Timeout) => Err(JoinError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_returns_value() {
        let handle = thread::spawn(|| 42);
        assert_eq!(handle.join_timeout(Duration::from_secs(1)), Ok(42));
    }

    #[test]
    fn test_join_times_out_on_stuck_thread() {
        let (_keep, stuck) = bounded::<()>(0);
        let handle = thread::spawn(move || {
            let _ = stuck.recv_timeout(Duration::from_secs(2));
        });
        assert_eq!(
            handle.join_timeout(Duration::from_millis(20)),
            Err(JoinError::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_join_reports_panic() {
        let handle = thread::spawn(|| panic!("boom"));
        assert_eq!(
            handle.join_timeout(Duration::from_secs(1)),
            Err(JoinError::Panicked)
        );
    }
}
