use chainops_domain::model::{GasParams, Network};

use crate::rpc::FeeSuggestion;

/// Used when the node refuses to estimate.
pub const FALLBACK_GAS_LIMIT: u64 = 300_000;

const PRIORITY_MULTIPLIER_PCT: u128 = 130;
const GAS_LIMIT_MULTIPLIER_PCT: u64 = 120;
const RETRY_MULTIPLIER_PCT: u128 = 150;

/// EIP-1559 pricing for a first submission: the suggested tip clamped to the
/// network floor plus 30%, and a max fee covering twice the base price.
pub fn initial_fees(network: Network, suggestion: FeeSuggestion, estimate: Option<u64>) -> GasParams {
    let priority = suggestion
        .max_priority_fee
        .max(network.min_priority_fee_wei())
        .saturating_mul(PRIORITY_MULTIPLIER_PCT)
        / 100;
    let max_fee = suggestion
        .gas_price
        .saturating_mul(2)
        .max(priority.saturating_add(suggestion.gas_price));

    GasParams {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority,
        gas_limit: estimate
            .map(|gas| gas.saturating_mul(GAS_LIMIT_MULTIPLIER_PCT) / 100)
            .unwrap_or(FALLBACK_GAS_LIMIT),
    }
}

/// Pricing for the retry after an included revert. Both fee fields end up
/// strictly above `previous`, and never below what `fresh` market data asks.
pub fn escalate(previous: GasParams, fresh: GasParams) -> GasParams {
    let bump = |value: u128| {
        (value.saturating_mul(RETRY_MULTIPLIER_PCT) / 100).max(value.saturating_add(1))
    };
    let priority = bump(previous.max_priority_fee_per_gas).max(fresh.max_priority_fee_per_gas);
    let max_fee = bump(previous.max_fee_per_gas)
        .max(fresh.max_fee_per_gas)
        .max(priority);

    GasParams {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority,
        gas_limit: previous.gas_limit.max(fresh.gas_limit),
    }
}
