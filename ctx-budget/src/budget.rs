//! Per-consumer token accounting.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BudgetError, BudgetResult};

/// Accounting state of one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Size of the consumer's context window in tokens.
    pub window: usize,
    /// Tokens currently reserved by projected entries.
    pub reserved: usize,
    /// Tokens still free.
    pub available: usize,
}

#[derive(Debug, Clone, Copy)]
struct Account {
    window: usize,
    reserved: usize,
}

impl Account {
    fn available(self) -> usize {
        self.window.saturating_sub(self.reserved)
    }

    fn snapshot(self) -> BudgetSnapshot {
        BudgetSnapshot {
            window: self.window,
            reserved: self.reserved,
            available: self.available(),
        }
    }
}

/// Tracks how much of each consumer's context window is in use.
///
/// Every operation runs under a single mutex, so `reserved <= window` holds
/// for every consumer even under concurrent callers.
#[derive(Debug, Default)]
pub struct TokenBudgetManager {
    accounts: Mutex<HashMap<ConsumerId, Account>>,
}

impl TokenBudgetManager {
    /// Creates a manager with no registered consumers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<ConsumerId, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a consumer or updates its window.
    ///
    /// Shrinking the window clamps the existing reservation.
    pub fn register_consumer(&self, consumer: ConsumerId, window: usize) -> BudgetSnapshot {
        let mut accounts = self.accounts();
        let account = accounts.entry(consumer.clone()).or_insert(Account {
            window,
            reserved: 0,
        });
        account.window = window;
        account.reserved = account.reserved.min(window);
        debug!(consumer = %consumer, window, reserved = account.reserved, "consumer budget registered");
        account.snapshot()
    }

    /// Removes a consumer, returning its final state.
    pub fn deregister_consumer(&self, consumer: &ConsumerId) -> Option<BudgetSnapshot> {
        self.accounts().remove(consumer).map(Account::snapshot)
    }

    /// Returns `true` when the consumer is registered.
    #[must_use]
    pub fn is_registered(&self, consumer: &ConsumerId) -> bool {
        self.accounts().contains_key(consumer)
    }

    /// Tokens still free for the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::UnknownConsumer`] for unregistered consumers.
    pub fn available(&self, consumer: &ConsumerId) -> BudgetResult<usize> {
        self.accounts()
            .get(consumer)
            .map(|account| account.available())
            .ok_or_else(|| BudgetError::unknown(consumer))
    }

    /// Reserves exactly `tokens`, or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Insufficient`] when fewer tokens are available,
    /// or [`BudgetError::UnknownConsumer`].
    pub fn reserve(&self, consumer: &ConsumerId, tokens: usize) -> BudgetResult<()> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(consumer)
            .ok_or_else(|| BudgetError::unknown(consumer))?;
        let available = account.available();
        if tokens > available {
            return Err(BudgetError::Insufficient {
                requested: tokens,
                available,
            });
        }
        account.reserved += tokens;
        Ok(())
    }

    /// Reserves `min(tokens, available)` and returns the amount granted.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::UnknownConsumer`].
    pub fn reserve_up_to(&self, consumer: &ConsumerId, tokens: usize) -> BudgetResult<usize> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(consumer)
            .ok_or_else(|| BudgetError::unknown(consumer))?;
        let granted = tokens.min(account.available());
        account.reserved += granted;
        Ok(granted)
    }

    /// Returns `tokens` to the consumer. Over-release saturates at zero.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::UnknownConsumer`].
    pub fn release(&self, consumer: &ConsumerId, tokens: usize) -> BudgetResult<()> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(consumer)
            .ok_or_else(|| BudgetError::unknown(consumer))?;
        account.reserved = account.reserved.saturating_sub(tokens);
        Ok(())
    }

    /// Returns the consumer's accounting state.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::UnknownConsumer`].
    pub fn snapshot(&self, consumer: &ConsumerId) -> BudgetResult<BudgetSnapshot> {
        self.accounts()
            .get(consumer)
            .map(|account| account.snapshot())
            .ok_or_else(|| BudgetError::unknown(consumer))
    }

    /// Returns every consumer's state ordered by identifier.
    #[must_use]
    pub fn snapshots(&self) -> Vec<(ConsumerId, BudgetSnapshot)> {
        let mut all: Vec<_> = self
            .accounts()
            .iter()
            .map(|(id, account)| (id.clone(), account.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
