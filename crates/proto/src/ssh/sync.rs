//! Error-propagating rendezvous primitives.
//!
//! [`Event`] is a level-triggered latch that can be completed either
//! successfully or with a stored error. Completion in either direction wakes
//! every waiter: successful waiters return `Ok`, failed ones a copy of the
//! stored cause. `clear` re-arms the latch, which is how the kex-done event
//! is reused across rekeys.

use skiff_platform::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum State {
    Clear,
    Set,
    Failed(Arc<Error>),
}

/// A one-shot, re-armable event with error injection.
#[derive(Debug, Clone)]
pub struct Event {
    name: &'static str,
    tx: watch::Sender<State>,
}

impl Event {
    /// Creates a cleared event. The name appears in timeout errors.
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(State::Clear);
        Self { name, tx }
    }

    /// Completes the event successfully, waking all waiters.
    pub fn set(&self) {
        self.tx.send_replace(State::Set);
    }

    /// Completes the event with an error, waking all waiters.
    pub fn fail(&self, err: Error) {
        self.tx.send_replace(State::Failed(Arc::new(err)));
    }

    /// Re-arms the event.
    pub fn clear(&self) {
        self.tx.send_replace(State::Clear);
    }

    /// Whether the event is currently set (successfully).
    pub fn is_set(&self) -> bool {
        matches!(*self.tx.borrow(), State::Set)
    }

    /// Waits until the event completes, up to `timeout`.
    ///
    /// # Errors
    ///
    /// - a copy of the stored cause if the event failed
    /// - [`Error::Timeout`] if the deadline passes first
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let awaited = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    State::Set => return Ok(()),
                    State::Failed(cause) => return Err(cause.duplicate()),
                    State::Clear => {
                        if rx.changed().await.is_err() {
                            return Err(Error::Protocol(format!(
                                "<{}> event dropped while waiting",
                                self.name
                            )));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, awaited)
            .await
            .map_err(|_| Error::Timeout(format!("waiting for <{}>", self.name)))?
    }
}
