use std::collections::HashMap;

use alloy::consensus::{SignableTransaction, TypedTransaction};
use alloy::primitives::Address;
use alloy::signers::{Signature, Signer, local::PrivateKeySigner};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy)]
pub struct SigningOptions {
    pub from: Address,
    pub chain_id: Option<u64>,
}

/// Produces signatures for server-custodied senders. Key custody is behind
/// this seam; workers only ever see addresses and signatures.
pub trait WalletSigner: Send + Sync + 'static {
    fn sign_transaction(
        &self,
        options: SigningOptions,
        tx: &TypedTransaction,
    ) -> impl Future<Output = Result<Signature, RelayError>> + Send;
}

/// In-process signer registry over local private keys.
#[derive(Default)]
pub struct LocalWalletRegistry {
    wallets: HashMap<Address, PrivateKeySigner>,
}

impl LocalWalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signer: PrivateKeySigner) -> Address {
        let address = signer.address();
        self.wallets.insert(address, signer);
        address
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.wallets.contains_key(address)
    }
}

impl WalletSigner for LocalWalletRegistry {
    async fn sign_transaction(
        &self,
        options: SigningOptions,
        tx: &TypedTransaction,
    ) -> Result<Signature, RelayError> {
        let signer =
            self.wallets
                .get(&options.from)
                .ok_or_else(|| RelayError::SigningError {
                    address: options.from.to_string(),
                    message: "no key material registered for sender".to_string(),
                })?;

        signer
            .sign_hash(&tx.signature_hash())
            .await
            .map_err(|e| RelayError::SigningError {
                address: options.from.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::TxEip1559;
    use alloy::primitives::TxKind;

    fn sample_tx() -> TypedTransaction {
        TypedTransaction::Eip1559(TxEip1559 {
            chain_id: 137,
            nonce: 5,
            gas_limit: 21_000,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(Address::ZERO),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn signs_for_registered_senders_only() {
        let mut registry = LocalWalletRegistry::new();
        let sender = registry.register(PrivateKeySigner::random());

        let options = SigningOptions {
            from: sender,
            chain_id: Some(137),
        };
        assert!(registry.sign_transaction(options, &sample_tx()).await.is_ok());

        let unknown = SigningOptions {
            from: Address::ZERO,
            chain_id: Some(137),
        };
        let err = registry
            .sign_transaction(unknown, &sample_tx())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SigningError { .. }));
    }
}
