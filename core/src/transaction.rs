use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// The fully-formed write payload for one intent. Produced upstream (ABI
/// encoding, helpers); the relay only decides when and in what order it
/// reaches the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIntent {
    /// `None` deploys a contract.
    pub to: Option<Address>,

    #[serde(default)]
    pub data: Bytes,

    #[serde(default)]
    pub value: U256,

    /// If not provided, the pipeline estimates gas with headroom.
    #[serde(default, alias = "gas")]
    pub gas_limit: Option<u64>,

    /// Explicit fee overrides; missing pieces are estimated.
    #[serde(flatten)]
    pub transaction_type_data: Option<TransactionTypeData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionTypeData {
    Eip1559(Transaction1559Data),
    Legacy(TransactionLegacyData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction1559Data {
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLegacyData {
    pub gas_price: Option<u128>,
}

/// How the sender's transactions reach the chain. A smart-account sender
/// submits through a bundler and is identified by a userop hash; the state
/// machine and nonce bookkeeping are otherwise identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ExecutionMode {
    #[default]
    Eoa,
    Erc4337 {
        entrypoint: Address,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_intent_deserializes_with_defaults() {
        let intent: TransactionIntent =
            serde_json::from_str(r#"{"to":"0x0000000000000000000000000000000000000001"}"#).unwrap();
        assert!(intent.to.is_some());
        assert!(intent.data.is_empty());
        assert_eq!(intent.value, U256::ZERO);
        assert!(intent.gas_limit.is_none());
    }

    #[test]
    fn fee_overrides_parse_as_eip1559_when_present() {
        let intent: TransactionIntent = serde_json::from_str(
            r#"{"to":null,"maxFeePerGas":100,"maxPriorityFeePerGas":2}"#,
        )
        .unwrap();
        match intent.transaction_type_data {
            Some(TransactionTypeData::Eip1559(data)) => {
                assert_eq!(data.max_fee_per_gas, Some(100));
                assert_eq!(data.max_priority_fee_per_gas, Some(2));
            }
            other => panic!("expected EIP-1559 overrides, got {other:?}"),
        }
    }

    #[test]
    fn execution_mode_defaults_to_eoa() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Eoa);
    }
}
