use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

/// Which balance a credit movement applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditType {
    /// Pre-paid rehearsal time, counted in blocks.
    FreeHours,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient credit for {member}: requested {requested} blocks, {available} available")]
    InsufficientCredit {
        member: Ulid,
        requested: u32,
        available: u32,
    },
    #[error("ledger backend error: {0}")]
    Backend(String),
}

/// Per-member, per-credit-type balance in blocks. Balances never go negative.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn is_subscriber(&self, member: Ulid) -> Result<bool, LedgerError>;

    async fn balance(&self, member: Ulid, credit: &CreditType) -> Result<u32, LedgerError>;

    /// Start of a billing cycle: the balance is replaced, unused blocks are lost.
    async fn allocate_monthly(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
    ) -> Result<(), LedgerError>;

    /// Mid-cycle tier change: add the difference between the new and old
    /// allocation. A downgrade never takes the balance below zero.
    async fn apply_upgrade_delta(
        &self,
        member: Ulid,
        delta: i64,
        credit: &CreditType,
    ) -> Result<u32, LedgerError>;

    /// Remove `blocks` from the balance, failing rather than clamping.
    /// Returns the remaining balance.
    async fn deduct(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
        reason: &str,
    ) -> Result<u32, LedgerError>;

    /// Give back blocks consumed by a booking that was cancelled or rescheduled.
    async fn refund(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
        reason: &str,
    ) -> Result<u32, LedgerError>;
}

#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<(Ulid, CreditType), u32>,
    subscribers: DashSet<Ulid>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subscriber(&self, member: Ulid, subscribed: bool) {
        if subscribed {
            self.subscribers.insert(member);
        } else {
            self.subscribers.remove(&member);
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn is_subscriber(&self, member: Ulid) -> Result<bool, LedgerError> {
        Ok(self.subscribers.contains(&member))
    }

    async fn balance(&self, member: Ulid, credit: &CreditType) -> Result<u32, LedgerError> {
        Ok(self
            .balances
            .get(&(member, credit.clone()))
            .map(|e| *e.value())
            .unwrap_or(0))
    }

    async fn allocate_monthly(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
    ) -> Result<(), LedgerError> {
        self.balances.insert((member, credit.clone()), blocks);
        debug!("allocated {blocks} {credit:?} blocks to {member}");
        Ok(())
    }

    async fn apply_upgrade_delta(
        &self,
        member: Ulid,
        delta: i64,
        credit: &CreditType,
    ) -> Result<u32, LedgerError> {
        let mut entry = self.balances.entry((member, credit.clone())).or_insert(0);
        let next = (i64::from(*entry) + delta).clamp(0, i64::from(u32::MAX));
        *entry = next as u32;
        Ok(*entry)
    }

    async fn deduct(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
        reason: &str,
    ) -> Result<u32, LedgerError> {
        if blocks == 0 {
            return self.balance(member, credit).await;
        }
        let key = (member, credit.clone());
        let Some(mut entry) = self.balances.get_mut(&key) else {
            return Err(LedgerError::InsufficientCredit {
                member,
                requested: blocks,
                available: 0,
            });
        };
        if *entry < blocks {
            return Err(LedgerError::InsufficientCredit {
                member,
                requested: blocks,
                available: *entry,
            });
        }
        *entry -= blocks;
        debug!("deducted {blocks} {credit:?} blocks from {member}: {reason}");
        Ok(*entry)
    }

    async fn refund(
        &self,
        member: Ulid,
        blocks: u32,
        credit: &CreditType,
        reason: &str,
    ) -> Result<u32, LedgerError> {
        let mut entry = self.balances.entry((member, credit.clone())).or_insert(0);
        *entry = entry.saturating_add(blocks);
        debug!("refunded {blocks} {credit:?} blocks to {member}: {reason}");
        Ok(*entry)
    }
}
