use super::ids::{SessionRef, UserId};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A positive monetary amount paid for a credit plan.
///
/// Collaborators quote prices in minor units (cents); the ledger keeps the decimal value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    /// Fails with `InvariantViolation` unless `value` is positive.
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(SyncError::InvariantViolation(
                "Amount must be positive".to_string(),
            ))
        }
    }

    /// Builds an amount from minor units with two decimal places (`2000` is `20.00`).
    pub fn from_minor_units(minor: i64) -> Result<Self> {
        Self::new(Decimal::new(minor, 2))
    }

    /// The decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// The amount in minor units, truncated.
    pub fn minor_units(&self) -> i64 {
        (self.0 * Decimal::ONE_HUNDRED)
            .trunc()
            .try_into()
            .unwrap_or(i64::MAX)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = SyncError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// A purchasable bundle of credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPlan {
    pub id: String,
    pub credits: i64,
    pub price: Amount,
}

/// The credit balance of one user. The balance is never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: UserId,
    balance: i64,
}

impl CreditAccount {
    /// An account with a zero balance.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
        }
    }

    /// Rebuilds an account from a store row, rejecting negative balances.
    pub fn with_balance(user_id: UserId, balance: i64) -> Result<Self> {
        if balance < 0 {
            return Err(SyncError::InvariantViolation(format!(
                "negative balance {balance} for user {user_id}"
            )));
        }
        Ok(Self { user_id, balance })
    }

    /// Current credit balance; never negative.
    pub fn balance(&self) -> i64 {
        self.balance
    }

    /// Adds purchased credits. Only the payment collaborator's settlement path calls this.
    pub fn credit(&mut self, credits: i64) -> Result<()> {
        let next = self
            .balance
            .checked_add(credits)
            .filter(|next| *next >= 0)
            .ok_or_else(|| {
                SyncError::InvariantViolation(format!(
                    "crediting {credits} to {} would leave an invalid balance",
                    self.user_id
                ))
            })?;
        self.balance = next;
        Ok(())
    }
}

/// Settlement state of a credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// `completed` and `failed` are final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Status only moves forward: `pending -> completed | failed`.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        self == next || self == TransactionStatus::Pending
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(SyncError::InvariantViolation(format!(
                "unrecognized transaction status '{other}'"
            ))),
        }
    }
}

/// One credit purchase, settled asynchronously by the payment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: Amount,
    pub credits_purchased: i64,
    pub status: TransactionStatus,
    /// Unique per transaction; equal to the checkout session reference.
    pub external_reference: SessionRef,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// The transaction recorded when a checkout for `plan` opens.
    pub fn pending(
        user_id: UserId,
        plan: &CreditPlan,
        external_reference: SessionRef,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount: plan.price,
            credits_purchased: plan.credits,
            status: TransactionStatus::Pending,
            external_reference,
            created_at,
        }
    }

    /// Applies a status change, refusing to move out of a terminal status.
    pub fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvariantViolation(format!(
                "transaction {} cannot move from {} to {}",
                self.external_reference, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}
