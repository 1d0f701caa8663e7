//! Fair async mutex serializing streaming turns against the orchestrator.
//!
//! At most one streaming turn (user-initiated or injected sub-task result)
//! runs at a time. Fairness is strict FIFO with a handoff discipline:
//! `release` transfers ownership to the head waiter in the same step, so a
//! caller arriving after the release queues behind that waiter rather than
//! racing it for the lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct ChatLock {
    state: Mutex<LockState>,
}

impl ChatLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, parking FIFO behind the current holder. The
    /// returned guard releases on drop.
    pub async fn acquire(&self) -> ChatLockGuard<'_> {
        let waiter = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.locked {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.locked = true;
                None
            }
        };

        if let Some(rx) = waiter {
            // A handoff keeps `locked` set; an Err means the lock itself was
            // torn down, in which case there is nothing left to contend for.
            let _ = rx.await;
        }

        ChatLockGuard { lock: self }
    }

    /// Number of parked waiters. Diagnostic only.
    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .waiters
            .len()
    }

    fn release(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            match state.waiters.pop_front() {
                // Ownership transfers to the waiter; `locked` stays true.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // Waiter's acquire future was dropped; try the next one.
                    continue;
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

pub struct ChatLockGuard<'a> {
    lock: &'a ChatLock,
}

impl Drop for ChatLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
