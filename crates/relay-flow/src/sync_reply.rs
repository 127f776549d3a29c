//! Time-boxed synchronous-reply slots.
//!
//! A caller that wants an immediate answer holds a reply slot keyed by
//! transaction ID while the engine runs. Exactly one of two outcomes
//! consumes the slot: the completion arrives first and the caller gets it,
//! or the window elapses first and the caller falls back to polling. The
//! oneshot channel underneath makes the two paths mutually exclusive.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;

use relay_core::TxId;

use crate::error::{Error, Result};
use crate::transaction::TxCompletion;

/// Outcome of waiting on a reply slot.
#[derive(Debug)]
pub enum Reply {
    /// The completion arrived within the window.
    Completed(TxCompletion),
    /// The window elapsed; the caller should poll for the result.
    Poll,
}

/// Registry of open reply slots, keyed by transaction ID.
#[derive(Debug, Default)]
pub struct ReplyRouter {
    pending: HashMap<TxId, oneshot::Sender<TxCompletion>>,
}

impl ReplyRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a reply slot for a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a slot is already open for the transaction;
    /// at most one timer guards each transaction.
    pub fn register(&mut self, tx_id: TxId) -> Result<oneshot::Receiver<TxCompletion>> {
        if self.pending.contains_key(&tx_id) {
            return Err(Error::internal(format!(
                "reply slot already open for transaction {tx_id}"
            )));
        }
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(tx_id, sender);
        Ok(receiver)
    }

    /// Resolves a slot with the transaction's completion.
    ///
    /// Returns true if a waiting caller consumed the completion; false if
    /// no slot was open or the caller had already timed out.
    pub fn resolve(&mut self, tx_id: TxId, completion: TxCompletion) -> bool {
        match self.pending.remove(&tx_id) {
            Some(sender) => sender.send(completion).is_ok(),
            None => false,
        }
    }

    /// Returns the number of open slots.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.pending.len()
    }
}

/// Waits on a reply slot for at most `window`.
pub async fn await_reply(
    receiver: oneshot::Receiver<TxCompletion>,
    window: Duration,
) -> Reply {
    match tokio::time::timeout(window, receiver).await {
        Ok(Ok(completion)) => Reply::Completed(completion),
        // Window elapsed, or the scheduler dropped the slot.
        Ok(Err(_)) | Err(_) => Reply::Poll,
    }
}
