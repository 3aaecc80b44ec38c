// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cancellation and deadlines for blocking queue calls.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, Sender, TryRecvError, at, bounded, never};
use parking_lot::Mutex;

/// Why a call gave up before doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    DeadlineElapsed,
}

/// Handle passed to every blocking client call.
///
/// Clones share cancellation: cancelling one cancels all of them. The
/// deadline, if any, is fixed at construction.
///
/// Cancellation is signalled by dropping the sending half of a channel that
/// never carries a message, so it can sit in a `select!` next to the
/// operation it interrupts.
#[derive(Clone)]
pub struct CancelToken {
    signal:   Receiver<()>,
    trigger:  Option<Arc<Mutex<Option<Sender<()>>>>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that fires only when [`cancel`](Self::cancel) is called.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            signal,
            trigger: Some(Arc::new(Mutex::new(Some(trigger)))),
            deadline: None,
        }
    }

    /// A token that never fires.
    #[must_use]
    pub fn none() -> Self {
        Self {
            signal:   never(),
            trigger:  None,
            deadline: None,
        }
    }

    /// A cancellable token that also expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self { Self::with_deadline(Instant::now() + timeout) }

    /// A cancellable token that also expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    /// Cancels this token and every clone of it. A no-op on [`none`](Self::none).
    pub fn cancel(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.lock().take();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> { self.deadline }

    #[must_use]
    pub fn is_expired(&self) -> bool { self.deadline.is_some_and(|d| Instant::now() >= d) }

    pub(crate) fn interruption(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.is_expired() {
            Some(Interrupt::DeadlineElapsed)
        } else {
            None
        }
    }

    /// Becomes ready (disconnected) once the token is cancelled.
    pub(crate) const fn signal(&self) -> &Receiver<()> { &self.signal }

    /// Delivers one message at the deadline, or never.
    pub(crate) fn expiry(&self) -> Receiver<Instant> { self.deadline.map_or_else(never, at) }
}

impl Default for CancelToken {
    fn default() -> Self { Self::none() }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::select;

    use super::*;

    #[test]
    fn test_new_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.is_expired());
        assert_eq!(token.interruption(), None);
    }

    #[test]
    fn test_cancel_reaches_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.interruption(), Some(Interrupt::Cancelled));
    }

    #[test]
    fn test_none_never_fires() {
        let token = CancelToken::none();
        token.cancel();
        assert!(!token.is_cancelled());
        assert!(token.deadline().is_none());
    }

    #[test]
    fn test_deadline_expires() {
        let token = CancelToken::with_timeout(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(token.is_expired());
        assert_eq!(token.interruption(), Some(Interrupt::DeadlineElapsed));
    }

    #[test]
    fn test_signal_wakes_select() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });

        let woke_on_cancel = select! {
            recv(token.signal()) -> _ => true,
            recv(token.expiry()) -> _ => false,
            default(Duration::from_secs(5)) => false,
        };
        assert!(woke_on_cancel);
        handle.join().unwrap();
    }
}
