//! In-memory cache of live transactions and their steps.
//!
//! While a transaction is active on a node, this cache is the authoritative
//! view of its state. Completed transactions are retained for a bounded
//! window so status queries keep answering, then evicted together with
//! their steps.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use relay_core::{StepId, TxId};

use crate::error::{Error, Result};
use crate::step::{Step, sequence_sort_key};
use crate::transaction::Transaction;

/// A transaction together with its ordered step tree, for detail queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetail {
    /// The transaction record.
    pub transaction: Transaction,
    /// Its steps, ordered by zero-padded `full_sequence`.
    pub steps: Vec<Step>,
}

/// Live transaction and step state for one node.
#[derive(Debug)]
pub struct TransactionCache {
    transactions: HashMap<TxId, Transaction>,
    steps: HashMap<StepId, Step>,
    steps_by_tx: HashMap<TxId, Vec<StepId>>,
    retention: Duration,
}

impl TransactionCache {
    /// Creates a cache retaining completed transactions for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            transactions: HashMap::new(),
            steps: HashMap::new(),
            steps_by_tx: HashMap::new(),
            retention,
        }
    }

    /// Inserts a freshly created transaction.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error when the ID is already live.
    pub fn insert_transaction(&mut self, transaction: Transaction) -> Result<()> {
        let tx_id = transaction.tx_id;
        if self.transactions.contains_key(&tx_id) {
            return Err(Error::internal(format!(
                "transaction {tx_id} is already cached"
            )));
        }
        self.transactions.insert(tx_id, transaction);
        Ok(())
    }

    /// Looks up a transaction.
    #[must_use]
    pub fn transaction(&self, tx_id: TxId) -> Option<&Transaction> {
        self.transactions.get(&tx_id)
    }

    /// Looks up a transaction mutably.
    pub fn transaction_mut(&mut self, tx_id: TxId) -> Option<&mut Transaction> {
        self.transactions.get_mut(&tx_id)
    }

    /// Registers a step before its invocation, so a step completing
    /// synchronously inline can already be found by the completion handler.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error when the ID is already live.
    pub fn register_step(&mut self, step: Step) -> Result<()> {
        let step_id = step.step_id;
        if self.steps.contains_key(&step_id) {
            return Err(Error::internal(format!("step {step_id} is already cached")));
        }
        self.steps_by_tx.entry(step.tx_id).or_default().push(step_id);
        self.steps.insert(step_id, step);
        Ok(())
    }

    /// Looks up a step.
    #[must_use]
    pub fn step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.get(&step_id)
    }

    /// Looks up a step mutably.
    pub fn step_mut(&mut self, step_id: StepId) -> Option<&mut Step> {
        self.steps.get_mut(&step_id)
    }

    /// Returns the number of non-terminal transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.transactions
            .values()
            .filter(|tx| !tx.is_terminal())
            .count()
    }

    /// Lists transactions, newest-first by start time, capped at `cap`.
    ///
    /// Completed transactions are included only when requested.
    #[must_use]
    pub fn list_transactions(&self, include_completed: bool, cap: usize) -> Vec<&Transaction> {
        let mut listed: Vec<&Transaction> = self
            .transactions
            .values()
            .filter(|tx| include_completed || !tx.is_terminal())
            .collect();
        listed.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.tx_id.cmp(&a.tx_id)));
        listed.truncate(cap);
        listed
    }

    /// Lists a transaction's steps ordered by zero-padded `full_sequence`.
    #[must_use]
    pub fn list_steps(&self, tx_id: TxId) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self
            .steps_by_tx
            .get(&tx_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|step_id| self.steps.get(step_id))
            .collect();
        steps.sort_by_key(|step| sequence_sort_key(&step.full_sequence));
        steps
    }

    /// Fetches a transaction with its ordered step tree.
    #[must_use]
    pub fn transaction_detail(&self, tx_id: TxId) -> Option<TransactionDetail> {
        let transaction = self.transactions.get(&tx_id)?.clone();
        let steps = self
            .list_steps(tx_id)
            .into_iter()
            .cloned()
            .collect();
        Some(TransactionDetail { transaction, steps })
    }

    /// Evicts completed transactions older than the retention window,
    /// along with their steps. Returns the number of evicted transactions.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<TxId> = self
            .transactions
            .values()
            .filter(|tx| {
                tx.is_terminal()
                    && tx
                        .completed_at
                        .is_some_and(|completed| now - completed > self.retention)
            })
            .map(|tx| tx.tx_id)
            .collect();

        for tx_id in &expired {
            self.transactions.remove(tx_id);
            if let Some(step_ids) = self.steps_by_tx.remove(tx_id) {
                for step_id in step_ids {
                    self.steps.remove(&step_id);
                }
            }
        }
        expired.len()
    }
}
