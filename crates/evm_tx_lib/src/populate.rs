use crate::account::AccountMeta;
use crate::err_custom_create;
use crate::error::EngineError;
use crate::model::{FeeData, PopulatedTx, TxRequestFields};
use crate::transaction::fields_to_call_request;
use async_trait::async_trait;
use std::str::FromStr;
use web3::types::{Address, CallRequest, U256};

/// Gas limit used when estimation keeps failing. Large enough for any call
/// that fits a block, small enough to never exceed one.
pub const FALLBACK_GAS_LIMIT: u64 = 10_000_000;

const GAS_SAFETY_MARGIN: u64 = 20000;

/// Network facing dependencies of the populator, implemented by the router
/// for each account kind.
#[async_trait]
pub trait PopulateBackend: Send + Sync {
    async fn fee_data(&self) -> Result<FeeData, EngineError>;
    async fn next_nonce(&self) -> Result<u64, EngineError>;
    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError>;
    async fn resolve_name(&self, name: &str) -> Result<Option<Address>, EngineError>;
}

fn validate_field_mix(fields: &TxRequestFields) -> Result<(), EngineError> {
    if fields.gas_price.is_some() && fields.has_eip1559_fields() {
        return Err(err_custom_create!(
            "Cannot mix gasPrice with maxFeePerGas/maxPriorityFeePerGas"
        ));
    }
    match fields.tx_type {
        Some(0) | Some(1) => {
            if fields.has_eip1559_fields() {
                return Err(err_custom_create!(
                    "Legacy transaction type cannot carry EIP-1559 fee fields"
                ));
            }
        }
        Some(2) => {
            if fields.gas_price.is_some() {
                return Err(err_custom_create!(
                    "EIP-1559 transaction type cannot carry gasPrice"
                ));
            }
        }
        Some(other) => {
            return Err(err_custom_create!("Unsupported transaction type {}", other));
        }
        None => {}
    }
    Ok(())
}

/// Whether fee resolution needs the chain's current fee data. Requests that
/// already carry a complete fee description short-circuit without a probe.
fn needs_fee_probe(fields: &TxRequestFields) -> bool {
    match fields.tx_type {
        Some(2) => fields.max_fee_per_gas.is_none() || fields.max_priority_fee_per_gas.is_none(),
        Some(_) => fields.gas_price.is_none(),
        None => {
            !(fields.max_fee_per_gas.is_some() && fields.max_priority_fee_per_gas.is_some())
        }
    }
}

/// The fee-field decision table. `fee_data` is only consulted on the paths
/// that genuinely need it; passing None on a short-circuit path is fine.
fn resolve_fee_fields(
    fields: &mut TxRequestFields,
    fee_data: Option<&FeeData>,
    populated: &mut Vec<&'static str>,
) -> Result<(), EngineError> {
    let fee_data_required = || err_custom_create!("Fee data required but not available");
    match fields.tx_type {
        Some(2) => {
            if fields.max_fee_per_gas.is_none() {
                let fd = fee_data.ok_or_else(fee_data_required)?;
                let max_fee = fd
                    .max_fee_per_gas
                    .ok_or_else(|| err_custom_create!("Chain does not provide EIP-1559 fees"))?;
                fields.max_fee_per_gas = Some(max_fee.to_string());
                populated.push("maxFeePerGas");
            }
            if fields.max_priority_fee_per_gas.is_none() {
                let fd = fee_data.ok_or_else(fee_data_required)?;
                let priority = fd
                    .max_priority_fee_per_gas
                    .ok_or_else(|| err_custom_create!("Chain does not provide EIP-1559 fees"))?;
                fields.max_priority_fee_per_gas = Some(priority.to_string());
                populated.push("maxPriorityFeePerGas");
            }
        }
        Some(_) => {
            if fields.gas_price.is_none() {
                let fd = fee_data.ok_or_else(fee_data_required)?;
                let gas_price = fd
                    .gas_price
                    .ok_or_else(|| err_custom_create!("Chain does not provide a gas price"))?;
                fields.gas_price = Some(gas_price.to_string());
                populated.push("gasPrice");
            }
        }
        None => {
            if fields.max_fee_per_gas.is_some() && fields.max_priority_fee_per_gas.is_some() {
                fields.tx_type = Some(2);
                return Ok(());
            }
            let fd = fee_data.ok_or_else(fee_data_required)?;
            if fd.supports_eip1559() {
                fields.tx_type = Some(2);
                if let Some(gas_price) = fields.gas_price.take() {
                    // A bare legacy price on a 1559 chain becomes both
                    // bounds, the exact fee the caller asked to pay.
                    fields.max_fee_per_gas = Some(gas_price.clone());
                    fields.max_priority_fee_per_gas = Some(gas_price);
                } else {
                    if fields.max_fee_per_gas.is_none() {
                        fields.max_fee_per_gas =
                            fd.max_fee_per_gas.map(|fee| fee.to_string());
                        populated.push("maxFeePerGas");
                    }
                    if fields.max_priority_fee_per_gas.is_none() {
                        fields.max_priority_fee_per_gas =
                            fd.max_priority_fee_per_gas.map(|fee| fee.to_string());
                        populated.push("maxPriorityFeePerGas");
                    }
                }
            } else if let Some(gas_price) = fd.gas_price {
                if fields.has_eip1559_fields() {
                    return Err(err_custom_create!(
                        "Chain does not support EIP-1559 fee fields"
                    ));
                }
                fields.tx_type = Some(0);
                if fields.gas_price.is_none() {
                    fields.gas_price = Some(gas_price.to_string());
                    populated.push("gasPrice");
                }
            } else {
                return Err(err_custom_create!("Cannot resolve fee fields for chain"));
            }
        }
    }
    Ok(())
}

fn is_insufficient_funds(err: &EngineError) -> bool {
    err.to_string().to_lowercase().contains("insufficient funds")
}

/// Fill in everything the caller left out. Fatal errors (bad field
/// combinations, unresolvable names, chain mismatch) propagate; a failed
/// gas estimation is absorbed into the fallback limit and reported through
/// `estimate_error` instead.
pub async fn populate_tx(
    account: &AccountMeta,
    fields: TxRequestFields,
    backend: &dyn PopulateBackend,
) -> Result<PopulatedTx, EngineError> {
    let mut fields = fields;
    let mut populated: Vec<&'static str> = Vec::new();
    let mut estimate_error = None;

    match &fields.from {
        None => {
            fields.from = Some(account.address.clone());
            populated.push("from");
        }
        Some(from) => {
            if !account.matches_address(from) {
                return Err(err_custom_create!(
                    "From address {} does not match account {}",
                    from,
                    account.address
                ));
            }
        }
    }

    if let Some(to) = fields.to.clone() {
        if Address::from_str(&to).is_err() {
            let resolved = backend
                .resolve_name(&to)
                .await?
                .ok_or_else(|| err_custom_create!("Could not resolve name: {}", to))?;
            fields.to = Some(format!("{:#x}", resolved));
            populated.push("to");
        }
    }

    validate_field_mix(&fields)?;

    let fee_data = if needs_fee_probe(&fields) {
        Some(backend.fee_data().await?)
    } else {
        None
    };
    resolve_fee_fields(&mut fields, fee_data.as_ref(), &mut populated)?;

    if fields.nonce.is_none() {
        fields.nonce = Some(backend.next_nonce().await?);
        populated.push("nonce");
    }

    match (fields.gas, fields.gas_limit) {
        (Some(_), Some(_)) => {
            return Err(err_custom_create!("Cannot specify both gas and gasLimit"));
        }
        (Some(gas), None) => {
            fields.gas = None;
            fields.gas_limit = Some(gas);
        }
        _ => {}
    }

    if fields.gas_limit.is_none() {
        let call = fields_to_call_request(&fields)?;
        let estimated = match backend.estimate_gas(call.clone()).await {
            Ok(gas) => Some(gas),
            Err(err) => {
                let has_value = call.value.map(|v| !v.is_zero()).unwrap_or(false);
                if is_insufficient_funds(&err) && has_value && fields.has_empty_data() {
                    // The balance check, not the call itself, is failing;
                    // retry without the value to learn the real limit.
                    let mut retry_call = call;
                    retry_call.value = None;
                    match backend.estimate_gas(retry_call).await {
                        Ok(gas) => Some(gas),
                        Err(retry_err) => {
                            estimate_error = Some(retry_err.to_string());
                            None
                        }
                    }
                } else {
                    estimate_error = Some(err.to_string());
                    None
                }
            }
        };
        fields.gas_limit = Some(match estimated {
            Some(gas) => (gas + U256::from(GAS_SAFETY_MARGIN)).as_u64(),
            None => FALLBACK_GAS_LIMIT,
        });
        populated.push("gasLimit");
    }

    match fields.chain_id {
        None => {
            fields.chain_id = Some(account.chain_id);
            populated.push("chainId");
        }
        Some(chain_id) => {
            if chain_id != account.chain_id {
                return Err(err_custom_create!(
                    "Chain id {} does not match account chain {}",
                    chain_id,
                    account.chain_id
                ));
            }
        }
    }

    // Canonicalize explicitly-empty call data so downstream equality checks
    // (cancellation detection among them) see one representation.
    if let Some(data) = &fields.data {
        if data.strip_prefix("0x").unwrap_or(data).is_empty() {
            fields.data = None;
        }
    }

    Ok(PopulatedTx {
        fields,
        populated,
        estimate_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const ACCOUNT_ADDR: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";
    const OTHER_ADDR: &str = "0x000000000000000000000000000000000000dead";

    fn test_account() -> AccountMeta {
        AccountMeta {
            master_id: "master-1".to_string(),
            derivation_index: 0,
            network_kind: "evm".to_string(),
            chain_id: 5,
            address: ACCOUNT_ADDR.to_string(),
            smart_account: None,
            multisig: None,
        }
    }

    struct StubBackend {
        fee_data: FeeData,
        fee_probes: Mutex<usize>,
        nonce: u64,
        gas_results: Mutex<VecDeque<Result<U256, String>>>,
        gas_calls: Mutex<Vec<CallRequest>>,
    }

    impl StubBackend {
        fn new(fee_data: FeeData) -> Self {
            StubBackend {
                fee_data,
                fee_probes: Mutex::new(0),
                nonce: 11,
                gas_results: Mutex::new(VecDeque::from([Ok(U256::from(21000))])),
                gas_calls: Mutex::new(Vec::new()),
            }
        }

        fn eip1559() -> FeeData {
            FeeData {
                gas_price: Some(U256::from(30_000_000_000u64)),
                max_fee_per_gas: Some(U256::from(40_000_000_000u64)),
                max_priority_fee_per_gas: Some(U256::from(1_500_000_000u64)),
            }
        }

        fn legacy() -> FeeData {
            FeeData {
                gas_price: Some(U256::from(30_000_000_000u64)),
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
            }
        }
    }

    #[async_trait]
    impl PopulateBackend for StubBackend {
        async fn fee_data(&self) -> Result<FeeData, EngineError> {
            *self.fee_probes.lock().unwrap() += 1;
            Ok(self.fee_data.clone())
        }

        async fn next_nonce(&self) -> Result<u64, EngineError> {
            Ok(self.nonce)
        }

        async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError> {
            self.gas_calls.lock().unwrap().push(call);
            match self.gas_results.lock().unwrap().pop_front() {
                Some(Ok(gas)) => Ok(gas),
                Some(Err(msg)) => Err(err_custom_create!("{}", msg)),
                None => Ok(U256::from(21000)),
            }
        }

        async fn resolve_name(&self, name: &str) -> Result<Option<Address>, EngineError> {
            if name == "payments.example" {
                Ok(Some(Address::from_low_u64_be(0xdead)))
            } else {
                Ok(None)
            }
        }
    }

    fn transfer_fields() -> TxRequestFields {
        TxRequestFields {
            to: Some(OTHER_ADDR.to_string()),
            value: Some("1000".to_string()),
            ..TxRequestFields::default()
        }
    }

    #[tokio::test]
    async fn test_from_defaulted_and_mismatch_fatal() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let populated = populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .unwrap();
        assert_eq!(populated.fields.from.as_deref(), Some(ACCOUNT_ADDR));
        assert!(populated.populated.contains(&"from"));

        let mut fields = transfer_fields();
        fields.from = Some(OTHER_ADDR.to_string());
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());

        // case-insensitive match is accepted
        let mut fields = transfer_fields();
        fields.from = Some(ACCOUNT_ADDR.to_uppercase().replace("0X", "0x"));
        assert!(populate_tx(&test_account(), fields, &backend).await.is_ok());
    }

    #[tokio::test]
    async fn test_name_resolution() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.to = Some("payments.example".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(
            populated.fields.to.as_deref(),
            Some("0x000000000000000000000000000000000000dead")
        );

        let mut fields = transfer_fields();
        fields.to = Some("unknown.example".to_string());
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());
    }

    #[tokio::test]
    async fn test_fee_field_mixing_rejected() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.gas_price = Some("1".to_string());
        fields.max_fee_per_gas = Some("2".to_string());
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());

        let mut fields = transfer_fields();
        fields.tx_type = Some(0);
        fields.max_fee_per_gas = Some("2".to_string());
        fields.max_priority_fee_per_gas = Some("1".to_string());
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());

        let mut fields = transfer_fields();
        fields.tx_type = Some(2);
        fields.gas_price = Some("1".to_string());
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_eip1559_fields_skip_fee_probe() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.max_fee_per_gas = Some("40000000000".to_string());
        fields.max_priority_fee_per_gas = Some("1500000000".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(populated.fields.tx_type, Some(2));
        assert_eq!(*backend.fee_probes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unset_type_upgrades_to_eip1559() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let populated = populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .unwrap();
        assert_eq!(populated.fields.tx_type, Some(2));
        assert_eq!(
            populated.fields.max_fee_per_gas.as_deref(),
            Some("40000000000")
        );
        assert!(populated.populated.contains(&"maxFeePerGas"));
    }

    #[tokio::test]
    async fn test_bare_gas_price_translated_on_eip1559_chain() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.gas_price = Some("25000000000".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(populated.fields.tx_type, Some(2));
        assert!(populated.fields.gas_price.is_none());
        assert_eq!(
            populated.fields.max_fee_per_gas.as_deref(),
            Some("25000000000")
        );
        assert_eq!(
            populated.fields.max_priority_fee_per_gas.as_deref(),
            Some("25000000000")
        );
    }

    #[tokio::test]
    async fn test_legacy_chain_downgrades_to_type_zero() {
        let backend = StubBackend::new(StubBackend::legacy());
        let populated = populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .unwrap();
        assert_eq!(populated.fields.tx_type, Some(0));
        assert_eq!(
            populated.fields.gas_price.as_deref(),
            Some("30000000000")
        );
    }

    #[tokio::test]
    async fn test_no_fee_source_is_fatal() {
        let backend = StubBackend::new(FeeData::default());
        assert!(populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_nonce_and_gas_populated() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let populated = populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .unwrap();
        assert_eq!(populated.fields.nonce, Some(11));
        assert_eq!(populated.fields.gas_limit, Some(21000 + GAS_SAFETY_MARGIN));
        assert!(populated.populated.contains(&"nonce"));
        assert!(populated.populated.contains(&"gasLimit"));
        assert!(populated.estimate_error.is_none());
    }

    #[tokio::test]
    async fn test_gas_alias() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.gas = Some(50000);
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(populated.fields.gas_limit, Some(50000));
        assert_eq!(populated.fields.gas, None);

        let mut fields = transfer_fields();
        fields.gas = Some(50000);
        fields.gas_limit = Some(60000);
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_funds_retry_before_fallback() {
        let backend = StubBackend::new(StubBackend::eip1559());
        *backend.gas_results.lock().unwrap() = VecDeque::from([
            Err("insufficient funds for transfer".to_string()),
            Ok(U256::from(21000)),
        ]);
        let mut fields = transfer_fields();
        fields.value = Some("1000000000000000000".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();

        let calls = backend.gas_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].value.is_some());
        assert!(calls[1].value.is_none());
        assert_eq!(populated.fields.gas_limit, Some(21000 + GAS_SAFETY_MARGIN));
        assert!(populated.estimate_error.is_none());
    }

    #[tokio::test]
    async fn test_estimation_fallback_records_error() {
        let backend = StubBackend::new(StubBackend::eip1559());
        *backend.gas_results.lock().unwrap() = VecDeque::from([
            Err("insufficient funds for transfer".to_string()),
            Err("insufficient funds for transfer".to_string()),
        ]);
        let mut fields = transfer_fields();
        fields.value = Some("1000000000000000000".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(populated.fields.gas_limit, Some(FALLBACK_GAS_LIMIT));
        assert!(populated.estimate_error.is_some());
    }

    #[tokio::test]
    async fn test_no_retry_when_data_present() {
        let backend = StubBackend::new(StubBackend::eip1559());
        *backend.gas_results.lock().unwrap() =
            VecDeque::from([Err("insufficient funds for transfer".to_string())]);
        let mut fields = transfer_fields();
        fields.value = Some("1000000000000000000".to_string());
        fields.data = Some("0xdeadbeef".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(backend.gas_calls.lock().unwrap().len(), 1);
        assert_eq!(populated.fields.gas_limit, Some(FALLBACK_GAS_LIMIT));
        assert!(populated.estimate_error.is_some());
    }

    #[tokio::test]
    async fn test_chain_id_validation() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let populated = populate_tx(&test_account(), transfer_fields(), &backend)
            .await
            .unwrap();
        assert_eq!(populated.fields.chain_id, Some(5));

        let mut fields = transfer_fields();
        fields.chain_id = Some(1);
        assert!(populate_tx(&test_account(), fields, &backend).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_data_normalized() {
        let backend = StubBackend::new(StubBackend::eip1559());
        let mut fields = transfer_fields();
        fields.data = Some("0x".to_string());
        let populated = populate_tx(&test_account(), fields, &backend).await.unwrap();
        assert_eq!(populated.fields.data, None);
    }
}
