use serde::{Deserialize, Serialize};
use web3::types::U256;

/// Caller supplied, partially filled transaction request. Field names form
/// the allowed set; anything else is rejected at deserialization time.
/// Numeric amounts travel as decimal strings, the storage convention used
/// for all records.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TxRequestFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Legacy alias for gas_limit, accepted on input and normalized away.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<u8>,
}

impl TxRequestFields {
    pub fn has_eip1559_fields(&self) -> bool {
        self.max_fee_per_gas.is_some() || self.max_priority_fee_per_gas.is_some()
    }

    pub fn has_empty_data(&self) -> bool {
        match &self.data {
            None => true,
            Some(data) => {
                let trimmed = data.strip_prefix("0x").unwrap_or(data);
                trimmed.is_empty()
            }
        }
    }
}

/// Kind specific submission envelope, stored as the opaque `info` payload of
/// a pending record and carried over to the confirmed record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TxSubmission {
    #[serde(rename_all = "camelCase")]
    Eoa {
        tx_hash: String,
        signed_raw_data: Option<String>,
        submitted_block: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    SmartAccount {
        user_op_hash: String,
        entry_point: String,
        sender_nonce: u64,
    },
    #[serde(rename_all = "camelCase")]
    Multisig {
        safe_tx_hash: String,
        safe_nonce: u64,
    },
}

impl TxSubmission {
    /// The hash callers use to identify this submission on the wire.
    pub fn submission_hash(&self) -> &str {
        match self {
            TxSubmission::Eoa { tx_hash, .. } => tx_hash,
            TxSubmission::SmartAccount { user_op_hash, .. } => user_op_hash,
            TxSubmission::Multisig { safe_tx_hash, .. } => safe_tx_hash,
        }
    }
}

/// Total order over confirmed records of one (account, type) pair.
/// `primary` is the block number; `secondary` is the zero padded in-block
/// position for EOA and Safe transactions or the operation hash for smart
/// accounts. Lexicographic comparison over the padded form preserves the
/// numeric order, so a plain string comparison is enough for pagination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub primary: i64,
    pub secondary: String,
}

impl OrderKey {
    pub fn zero() -> Self {
        OrderKey {
            primary: 0,
            secondary: String::new(),
        }
    }

    pub fn for_block_pos(block_number: i64, tx_index: i64) -> Self {
        OrderKey {
            primary: block_number,
            secondary: format!("{:0>8}", tx_index),
        }
    }

    pub fn for_operation(block_number: i64, op_hash: &str) -> Self {
        OrderKey {
            primary: block_number,
            secondary: op_hash.to_lowercase(),
        }
    }
}

/// Snapshot of the chain's current fee fields, the populator's decision
/// input. All three may be present on a post-London chain; only gas_price on
/// a legacy chain.
#[derive(Debug, Clone, Default)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl FeeData {
    pub fn supports_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some()
    }
}

/// Result of populating a request: the completed fields, the names of the
/// fields the engine filled in (for caller disclosure) and any non fatal
/// gas estimation error that was absorbed into a fallback.
#[derive(Debug, Clone)]
pub struct PopulatedTx {
    pub fields: TxRequestFields,
    pub populated: Vec<&'static str>,
    pub estimate_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_field_rejected() {
        let err = serde_json::from_str::<TxRequestFields>(r#"{"gasBudget": "1"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_gas_alias_accepted() {
        let fields: TxRequestFields = serde_json::from_str(
            r#"{"gas": 21000, "to": "0x0000000000000000000000000000000000000001"}"#,
        )
        .unwrap();
        assert_eq!(fields.gas, Some(21000));
        assert_eq!(fields.gas_limit, None);
    }

    #[test]
    fn test_order_key_total_order() {
        let a = OrderKey::for_block_pos(100, 2);
        let b = OrderKey::for_block_pos(100, 10);
        let c = OrderKey::for_block_pos(101, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_empty_data_detection() {
        let mut fields = TxRequestFields::default();
        assert!(fields.has_empty_data());
        fields.data = Some("0x".to_string());
        assert!(fields.has_empty_data());
        fields.data = Some("0xdeadbeef".to_string());
        assert!(!fields.has_empty_data());
    }
}
