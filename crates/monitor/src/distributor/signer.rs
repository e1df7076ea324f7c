use std::{fmt, str::FromStr};

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use thiserror::Error;

use chainops_domain::{config::SigningKey, model::GasParams};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// Never carries the key itself.
    #[error("signing key is not a valid secp256k1 private key")]
    InvalidKey,
    #[error("failed to sign transaction: {0}")]
    Sign(String),
}

/// Fields of a `distributeTokens` transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDistribution {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub input: Bytes,
    pub gas: GasParams,
}

/// Local signer for the distributor account.
pub struct DistributionSigner {
    address: Address,
    wallet: EthereumWallet,
}

impl DistributionSigner {
    pub fn from_key(key: &SigningKey) -> Result<Self, SignerError> {
        let signer =
            PrivateKeySigner::from_str(key.expose().trim()).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self {
            address: signer.address(),
            wallet: EthereumWallet::from(signer),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs an EIP-1559 transaction and returns its 2718 envelope bytes.
    pub async fn sign(&self, tx: &UnsignedDistribution) -> Result<Bytes, SignerError> {
        let request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(tx.to)
            .with_input(tx.input.clone())
            .with_chain_id(tx.chain_id)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas.gas_limit)
            .with_max_fee_per_gas(tx.gas.max_fee_per_gas)
            .with_max_priority_fee_per_gas(tx.gas.max_priority_fee_per_gas);

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|err| SignerError::Sign(err.to_string()))?;
        Ok(envelope.encoded_2718().into())
    }
}

impl fmt::Debug for DistributionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
