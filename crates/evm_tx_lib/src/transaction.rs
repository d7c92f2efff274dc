use crate::error::EngineError;
use crate::model::TxRequestFields;
use crate::utils::{trim_hex_prefix, ConversionError};
use crate::{err_custom_create, err_from};
use std::str::FromStr;
use web3::transports::Http;
use web3::types::{
    Address, Bytes, CallRequest, Transaction, TransactionId, TransactionParameters,
    TransactionReceipt, H256, U256, U64,
};
use web3::Web3;

pub fn decode_data_to_bytes(fields: &TxRequestFields) -> Result<Option<Bytes>, EngineError> {
    Ok(if let Some(data) = &fields.data {
        let hex_data = hex::decode(trim_hex_prefix(data))
            .map_err(|_err| err_custom_create!("Failed to convert data from hex"))?;
        Some(Bytes(hex_data))
    } else {
        None
    })
}

fn parse_opt_u256(value: &Option<String>, what: &str) -> Result<Option<U256>, EngineError> {
    value
        .as_ref()
        .map(|v| U256::from_dec_str(v))
        .transpose()
        .map_err(|_err| err_custom_create!("Failed to parse {} as decimal number", what))
}

fn parse_opt_address(value: &Option<String>, what: &str) -> Result<Option<Address>, EngineError> {
    value
        .as_ref()
        .map(|v| Address::from_str(v))
        .transpose()
        .map_err(|_err| err_custom_create!("Failed to parse {} as address", what))
}

/// Plain transfer request in the engine's field convention.
pub fn create_transfer_request(
    from: Address,
    to: Address,
    amount: U256,
    chain_id: i64,
) -> TxRequestFields {
    TxRequestFields {
        from: Some(format!("{:#x}", from)),
        to: Some(format!("{:#x}", to)),
        value: Some(amount.to_string()),
        chain_id: Some(chain_id),
        ..TxRequestFields::default()
    }
}

/// Contract call request carrying raw call data.
pub fn create_call_request(
    from: Address,
    contract: Address,
    call_data: Vec<u8>,
    chain_id: i64,
) -> TxRequestFields {
    TxRequestFields {
        from: Some(format!("{:#x}", from)),
        to: Some(format!("{:#x}", contract)),
        value: Some("0".to_string()),
        data: Some(format!("0x{}", hex::encode(call_data))),
        chain_id: Some(chain_id),
        ..TxRequestFields::default()
    }
}

/// eth_call / eth_estimateGas view of a request. Fee fields are passed
/// through when present; gas is left out so estimation is not constrained
/// by a caller supplied limit.
pub fn fields_to_call_request(fields: &TxRequestFields) -> Result<CallRequest, EngineError> {
    let max_fee_per_gas = parse_opt_u256(&fields.max_fee_per_gas, "maxFeePerGas")?;
    let max_priority_fee_per_gas =
        parse_opt_u256(&fields.max_priority_fee_per_gas, "maxPriorityFeePerGas")?;
    Ok(CallRequest {
        from: parse_opt_address(&fields.from, "from")?,
        to: parse_opt_address(&fields.to, "to")?,
        gas: fields.gas_limit.map(U256::from),
        gas_price: parse_opt_u256(&fields.gas_price, "gasPrice")?,
        value: parse_opt_u256(&fields.value, "value")?,
        data: decode_data_to_bytes(fields)?,
        transaction_type: fields.tx_type.map(|t| U64::from(t as u64)),
        access_list: None,
        max_fee_per_gas,
        max_priority_fee_per_gas,
    })
}

/// Signable view of a fully populated request. Fails if a required field is
/// still missing, so only populator output should reach this point.
pub fn fields_to_transaction_parameters(
    fields: &TxRequestFields,
) -> Result<TransactionParameters, EngineError> {
    let nonce = fields
        .nonce
        .ok_or_else(|| err_custom_create!("Missing nonce"))?;
    let gas_limit = fields
        .gas_limit
        .ok_or_else(|| err_custom_create!("Missing gas limit"))?;
    let chain_id = fields
        .chain_id
        .ok_or_else(|| err_custom_create!("Missing chain id"))?;
    let value = parse_opt_u256(&fields.value, "value")?.unwrap_or_else(U256::zero);

    let is_eip1559 = match fields.tx_type {
        Some(2) => true,
        Some(_) => false,
        None => fields.max_fee_per_gas.is_some(),
    };

    Ok(TransactionParameters {
        nonce: Some(U256::from(nonce)),
        to: parse_opt_address(&fields.to, "to")?,
        gas: U256::from(gas_limit),
        gas_price: if is_eip1559 {
            None
        } else {
            parse_opt_u256(&fields.gas_price, "gasPrice")?
        },
        value,
        data: decode_data_to_bytes(fields)?.unwrap_or_default(),
        chain_id: Some(chain_id as u64),
        transaction_type: fields.tx_type.map(|t| U64::from(t as u64)),
        access_list: None,
        max_fee_per_gas: if is_eip1559 {
            parse_opt_u256(&fields.max_fee_per_gas, "maxFeePerGas")?
        } else {
            None
        },
        max_priority_fee_per_gas: if is_eip1559 {
            parse_opt_u256(&fields.max_priority_fee_per_gas, "maxPriorityFeePerGas")?
        } else {
            None
        },
    })
}

pub async fn send_raw_transaction(
    web3: &Web3<Http>,
    signed_raw_data: &str,
) -> Result<H256, EngineError> {
    let bytes = Bytes(
        hex::decode(signed_raw_data)
            .map_err(|_err| ConversionError::from("cannot decode signed_raw_data".to_string()))
            .map_err(err_from!())?,
    );
    let tx_hash = web3
        .eth()
        .send_raw_transaction(bytes)
        .await
        .map_err(err_from!())?;
    Ok(tx_hash)
}

pub async fn find_receipt(
    web3: &Web3<Http>,
    tx_hash: H256,
) -> Result<Option<TransactionReceipt>, EngineError> {
    web3.eth()
        .transaction_receipt(tx_hash)
        .await
        .map_err(err_from!())
}

pub async fn find_transaction(
    web3: &Web3<Http>,
    tx_hash: H256,
) -> Result<Option<Transaction>, EngineError> {
    web3.eth()
        .transaction(TransactionId::Hash(tx_hash))
        .await
        .map_err(err_from!())
}

/// Fee actually paid for an included transaction.
pub fn receipt_fee_paid(receipt: &TransactionReceipt) -> Result<U256, EngineError> {
    let gas_used = receipt
        .gas_used
        .ok_or_else(|| err_custom_create!("Gas used expected"))?;
    let effective_gas_price = receipt
        .effective_gas_price
        .ok_or_else(|| err_custom_create!("Effective gas price expected"))?;
    Ok(gas_used * effective_gas_price)
}
