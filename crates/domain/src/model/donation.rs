use std::{str::FromStr, time::Duration};

use alloy_primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Decimals of the distributed ERC-20 token.
pub const TOKEN_DECIMALS: u8 = 18;

/// Tokens granted per whole USD donated unless configured otherwise.
pub const DEFAULT_TOKENS_PER_USD: u64 = 20;

/// Window inside which a repeated `(donor, usd)` pair is treated as the same
/// donation.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Errors emitted when a distribution request fails boundary validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid donor address `{0}`")]
    InvalidAddress(String),
    #[error("usd value must be a finite positive number")]
    NotANumber,
    #[error("usd value must be at least 1 after rounding down, got {0}")]
    BelowMinimum(String),
}

/// Parses a `0x`-prefixed 20-byte hex address. Mixed-case input must carry a
/// valid EIP-55 checksum.
pub fn parse_address(raw: &str) -> Result<Address, ValidationError> {
    let trimmed = raw.trim();
    let invalid = || ValidationError::InvalidAddress(trimmed.to_string());
    let Some(body) = trimmed.strip_prefix("0x") else {
        return Err(invalid());
    };
    if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        Address::parse_checksummed(trimmed, None).map_err(|_| invalid())
    } else {
        Address::from_str(trimmed).map_err(|_| invalid())
    }
}

/// Canonical lowercase `0x…` form used as a record-store key.
pub fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}

/// Rounds a USD amount down and rejects anything under one dollar: the
/// contract's integer math would turn it into zero tokens.
pub fn normalize_usd_value(raw: f64) -> Result<u64, ValidationError> {
    if !raw.is_finite() || raw < 0.0 {
        return Err(ValidationError::NotANumber);
    }
    let floored = raw.floor();
    if floored < 1.0 {
        return Err(ValidationError::BelowMinimum(raw.to_string()));
    }
    if floored > u64::MAX as f64 {
        return Err(ValidationError::NotANumber);
    }
    Ok(floored as u64)
}

/// Token base units owed for `usd_value` at `tokens_per_usd`.
pub fn tokens_for_usd(usd_value: u64, tokens_per_usd: u64) -> U256 {
    U256::from(usd_value)
        .saturating_mul(U256::from(tokens_per_usd))
        .saturating_mul(U256::from(10u64).pow(U256::from(TOKEN_DECIMALS)))
}

/// A validated request to reward a donor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationRequest {
    pub donor_address: Address,
    pub usd_value: u64,
    pub idempotency_window: Duration,
}

impl DonationRequest {
    pub fn parse(donor: &str, usd_value: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            donor_address: parse_address(donor)?,
            usd_value: normalize_usd_value(usd_value)?,
            idempotency_window: DEFAULT_DUPLICATE_WINDOW,
        })
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.idempotency_window = window;
        self
    }
}

/// EIP-1559 pricing and gas limit used for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Confirmed,
    Reverted,
    Failed,
}

/// One signed `distributeTokens` transaction. The hash is known as soon as
/// the envelope is signed, before any broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionAttempt {
    pub donation: DonationRequest,
    pub nonce: u64,
    pub gas: GasParams,
    pub attempt_number: u32,
    pub tx_hash: TxHash,
    pub status: AttemptStatus,
}

impl TransactionAttempt {
    pub fn audit_payload(&self, token_amount: U256) -> Value {
        json!({
            "txHash": format!("{:#x}", self.tx_hash),
            "attempt": self.attempt_number,
            "status": self.status.as_ref(),
            "nonce": self.nonce,
            "usdValue": self.donation.usd_value,
            "tokenAmount": token_amount.to_string(),
            "maxFeePerGas": self.gas.max_fee_per_gas.to_string(),
            "maxPriorityFeePerGas": self.gas.max_priority_fee_per_gas.to_string(),
            "gasLimit": self.gas.gas_limit,
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DistributionStatus {
    Pending,
    Distributed,
    Failed,
}

/// Persisted donation/distribution row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
    pub id: i64,
    pub donor_address: String,
    pub usd_value: u64,
    pub token_amount: String,
    pub status: DistributionStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDistribution {
    pub donor_address: String,
    pub usd_value: u64,
    pub token_amount: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionUpdate {
    pub status: DistributionStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionTotals {
    pub count: u64,
    /// Sum of distributed token base units.
    pub tokens: U256,
}
