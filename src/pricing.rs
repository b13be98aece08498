use serde::{Deserialize, Serialize};

use crate::ledger::{CreditLedger, CreditType, LedgerError};
use crate::model::{Holder, Ms, Span, HOUR_MS, MINUTE_MS};

/// Externally configured pricing. Money is in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub hourly_rate_cents: i64,
    /// Length of one credit block in the ledger.
    pub block_minutes: u32,
    pub min_duration_ms: Option<Ms>,
    pub max_duration_ms: Option<Ms>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            hourly_rate_cents: 1500,
            block_minutes: 30,
            min_duration_ms: None,
            max_duration_ms: None,
        }
    }
}

impl PricingConfig {
    pub fn block_ms(&self) -> Ms {
        Ms::from(self.block_minutes.max(1)) * MINUTE_MS
    }
}

/// How a booking's time splits between credit and cash.
///
/// Credit is consumed in whole blocks; a started block counts as used, but
/// only time the balance cannot cover is metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostBreakdown {
    pub total_ms: Ms,
    pub free_ms: Ms,
    pub paid_ms: Ms,
    pub free_blocks: u32,
    /// Ledger balance after `free_blocks` are consumed.
    pub remaining_blocks: u32,
    pub cost_cents: i64,
    pub is_subscriber: bool,
    pub block_ms: Ms,
}

fn hours(ms: Ms) -> f64 {
    ms as f64 / HOUR_MS as f64
}

impl CostBreakdown {
    pub fn total_hours(&self) -> f64 {
        hours(self.total_ms)
    }

    pub fn free_hours(&self) -> f64 {
        hours(self.free_ms)
    }

    pub fn paid_hours(&self) -> f64 {
        hours(self.paid_ms)
    }

    pub fn remaining_free_hours(&self) -> f64 {
        hours(Ms::from(self.remaining_blocks) * self.block_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostCalculator {
    config: PricingConfig,
}

impl CostCalculator {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Pure split of `span` given a credit balance. No ledger access.
    pub fn split(&self, span: &Span, available_blocks: u32, is_subscriber: bool) -> CostBreakdown {
        let block_ms = self.config.block_ms();
        let total_ms = span.duration_ms();
        let available = if is_subscriber { available_blocks } else { 0 };
        // A started block is consumed whole, but never covers more than the span.
        let blocks_needed = u32::try_from((total_ms + block_ms - 1) / block_ms).unwrap_or(u32::MAX);
        let free_blocks = blocks_needed.min(available);
        let free_ms = (Ms::from(free_blocks) * block_ms).min(total_ms);
        let paid_ms = total_ms - free_ms;
        // Round half up to the nearest cent.
        let cost_cents = (paid_ms * self.config.hourly_rate_cents + HOUR_MS / 2) / HOUR_MS;
        CostBreakdown {
            total_ms,
            free_ms,
            paid_ms,
            free_blocks,
            remaining_blocks: available - free_blocks,
            cost_cents,
            is_subscriber,
            block_ms,
        }
    }

    /// Read the holder's subscription and balance, then split. Guests and
    /// non-subscribers pay for every hour.
    pub async fn quote(
        &self,
        ledger: &dyn CreditLedger,
        holder: &Holder,
        span: &Span,
    ) -> Result<CostBreakdown, LedgerError> {
        let Some(member) = holder.member_id() else {
            return Ok(self.split(span, 0, false));
        };
        if !ledger.is_subscriber(member).await? {
            return Ok(self.split(span, 0, false));
        }
        let balance = ledger.balance(member, &CreditType::FreeHours).await?;
        Ok(self.split(span, balance, true))
    }
}
