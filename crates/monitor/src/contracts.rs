//! Fixed ABI of the token distributor and learn-to-earn contracts.

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    sol,
    sol_types::{SolCall, SolEvent},
};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::rpc::ChainLog;

sol! {
    interface ITokenDistributor {
        function distributeTokens(address donor, uint256 donationAmountUsd) external;
        function availableTokensForDistribution() external view returns (uint256);
        function distributors(address account) external view returns (bool);
        function owner() external view returns (address);

        event TokensDistributed(address indexed donor, uint256 tokenAmount, uint256 donationAmountUsd);
    }

    interface ILearn2Earn {
        event Learn2EarnClaimed(uint256 indexed learn2earnId, address indexed user, uint256 amount);
    }
}

pub fn tokens_distributed_signature() -> B256 {
    ITokenDistributor::TokensDistributed::SIGNATURE_HASH
}

pub fn learn2earn_claimed_signature() -> B256 {
    ILearn2Earn::Learn2EarnClaimed::SIGNATURE_HASH
}

pub fn distribute_call(donor: Address, usd_value: u64) -> Bytes {
    ITokenDistributor::distributeTokensCall {
        donor,
        donationAmountUsd: U256::from(usd_value),
    }
    .abi_encode()
    .into()
}

pub fn available_supply_call() -> Bytes {
    ITokenDistributor::availableTokensForDistributionCall {}
        .abi_encode()
        .into()
}

pub fn distributors_call(account: Address) -> Bytes {
    ITokenDistributor::distributorsCall { account }
        .abi_encode()
        .into()
}

pub fn owner_call() -> Bytes {
    ITokenDistributor::ownerCall {}.abi_encode().into()
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
}

pub fn decode_uint(data: &[u8]) -> Option<U256> {
    word(data, 0).map(U256::from_be_slice)
}

pub fn decode_bool(data: &[u8]) -> Option<bool> {
    word(data, 0).map(|w| w[31] != 0)
}

pub fn decode_address(data: &[u8]) -> Option<Address> {
    word(data, 0).map(|w| Address::from_slice(&w[12..]))
}

fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic[12..])
}

/// A decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    TokensDistributed {
        donor: Address,
        token_amount: U256,
        usd_value: U256,
    },
    Learn2EarnClaimed {
        learn2earn_id: U256,
        user: Address,
        amount: U256,
    },
}

/// Decodes the events this service understands; anything else is `None`.
pub fn decode_event(log: &ChainLog) -> Option<ContractEvent> {
    let signature = log.topics.first()?;
    if *signature == tokens_distributed_signature() {
        let donor = topic_address(log.topics.get(1)?);
        let token_amount = word(&log.data, 0).map(U256::from_be_slice)?;
        let usd_value = word(&log.data, 1).map(U256::from_be_slice)?;
        return Some(ContractEvent::TokensDistributed {
            donor,
            token_amount,
            usd_value,
        });
    }
    if *signature == learn2earn_claimed_signature() {
        let learn2earn_id = U256::from_be_bytes(log.topics.get(1)?.0);
        let user = topic_address(log.topics.get(2)?);
        let amount = decode_uint(&log.data)?;
        return Some(ContractEvent::Learn2EarnClaimed {
            learn2earn_id,
            user,
            amount,
        });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RevertKind {
    InsufficientTokens,
    NotAuthorized,
    Other,
}

/// Buckets a node's revert message by the contract's require strings.
pub fn classify_revert(message: &str) -> RevertKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("insufficient")
        || lower.contains("not enough tokens")
        || lower.contains("exceeds available")
    {
        RevertKind::InsufficientTokens
    } else if lower.contains("not authorized")
        || lower.contains("unauthorized")
        || lower.contains("not a distributor")
        || lower.contains("not the owner")
    {
        RevertKind::NotAuthorized
    } else {
        RevertKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, keccak256};

    #[test]
    fn signatures_match_event_declarations() {
        assert_eq!(
            tokens_distributed_signature(),
            keccak256("TokensDistributed(address,uint256,uint256)")
        );
        assert_eq!(
            learn2earn_claimed_signature(),
            keccak256("Learn2EarnClaimed(uint256,address,uint256)")
        );
    }

    #[test]
    fn calls_start_with_function_selector() {
        let donor = address!("52908400098527886e0f7030069857d2e4169ee7");
        let encoded = distribute_call(donor, 5);
        assert_eq!(
            &encoded[..4],
            &keccak256("distributeTokens(address,uint256)")[..4]
        );
        assert_eq!(encoded.len(), 4 + 64);
        assert_eq!(decode_address(&encoded[4..]), Some(donor));
        assert_eq!(
            &owner_call()[..],
            &keccak256("owner()")[..4]
        );
    }

    #[test]
    fn decodes_tokens_distributed_logs() {
        let donor = address!("52908400098527886e0f7030069857d2e4169ee7");
        let mut data = Vec::new();
        data.extend_from_slice(&U256::from(100u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(5u64).to_be_bytes::<32>());
        let log = ChainLog {
            address: Address::ZERO,
            topics: vec![tokens_distributed_signature(), donor.into_word()],
            data: data.into(),
            block_number: Some(1),
            tx_hash: None,
        };
        assert_eq!(
            decode_event(&log),
            Some(ContractEvent::TokensDistributed {
                donor,
                token_amount: U256::from(100u64),
                usd_value: U256::from(5u64),
            })
        );
    }

    #[test]
    fn truncated_logs_are_ignored() {
        let log = ChainLog {
            address: Address::ZERO,
            topics: vec![learn2earn_claimed_signature()],
            data: Bytes::new(),
            block_number: None,
            tx_hash: None,
        };
        assert_eq!(decode_event(&log), None);
    }

    #[test]
    fn classifies_common_revert_reasons() {
        assert_eq!(
            classify_revert("execution reverted: Insufficient tokens available"),
            RevertKind::InsufficientTokens
        );
        assert_eq!(
            classify_revert("execution reverted: Caller is not a distributor"),
            RevertKind::NotAuthorized
        );
        assert_eq!(classify_revert("execution reverted"), RevertKind::Other);
        assert_eq!(RevertKind::NotAuthorized.as_ref(), "not_authorized");
    }
}
