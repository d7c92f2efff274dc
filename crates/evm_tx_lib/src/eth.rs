use crate::error::EngineError;
use crate::{err_custom_create, err_from};
use secp256k1::{PublicKey, SecretKey};
use sha3::Digest;
use sha3::Keccak256;
use std::sync::Arc;
use tokio::sync::Semaphore;
use web3::transports::Http;
use web3::types::{Address, BlockNumber, U256};
use web3::Web3;

/// Upper bound on concurrent balance queries against one RPC endpoint.
const MAX_CONCURRENT_BALANCE_CALLS: usize = 3;

pub async fn get_transaction_count(
    address: Address,
    web3: &Web3<Http>,
    pending: bool,
) -> Result<u64, web3::Error> {
    let nonce_type = match pending {
        true => BlockNumber::Pending,
        false => BlockNumber::Latest,
    };
    let nonce = web3
        .eth()
        .transaction_count(address, Some(nonce_type))
        .await?;
    Ok(nonce.as_u64())
}

pub async fn get_latest_block_number(web3: &Web3<Http>) -> Result<u64, EngineError> {
    let block_number = web3.eth().block_number().await.map_err(err_from!())?;
    Ok(block_number.as_u64())
}

pub fn get_eth_addr_from_secret(secret_key: &SecretKey) -> Address {
    Address::from_slice(
        &Keccak256::digest(
            &PublicKey::from_secret_key(&secp256k1::Secp256k1::new(), secret_key)
                .serialize_uncompressed()[1..65],
        )
        .as_slice()[12..],
    )
}

/// Balances for a list of addresses, fanned out over at most
/// MAX_CONCURRENT_BALANCE_CALLS in-flight requests. Results come back in the
/// caller supplied order regardless of completion order.
pub async fn get_balances(
    web3: &Web3<Http>,
    addresses: &[Address],
) -> Result<Vec<U256>, EngineError> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_BALANCE_CALLS));
    let mut handles = Vec::with_capacity(addresses.len());
    for address in addresses {
        let address = *address;
        let web3 = web3.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let res = web3.eth().balance(address, None).await;
            drop(permit);
            res
        }));
    }
    let mut balances = Vec::with_capacity(addresses.len());
    for handle in handles {
        let balance = handle
            .await
            .map_err(|e| err_custom_create!("Balance task failed: {}", e))?
            .map_err(err_from!())?;
        balances.push(balance);
    }
    Ok(balances)
}
