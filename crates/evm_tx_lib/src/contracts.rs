use lazy_static::lazy_static;
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::error;
use std::str::FromStr;
use web3::contract::tokens::Tokenize;
use web3::contract::Contract;
use web3::ethabi::{encode, Token};
use web3::transports::Http;
use web3::types::{Address, H256, U256};
use web3::{Transport, Web3};

lazy_static! {
    pub static ref DUMMY_RPC_PROVIDER: Web3<Http> = {
        let transport = web3::transports::Http::new("http://noconn").unwrap();
        Web3::new(transport)
    };
    pub static ref ENTRY_POINT_CONTRACT_TEMPLATE: Contract<Http> =
        { prepare_contract_template(include_bytes!("../contracts/entry_point.json")).unwrap() };
    pub static ref SMART_ACCOUNT_CONTRACT_TEMPLATE: Contract<Http> =
        { prepare_contract_template(include_bytes!("../contracts/smart_account.json")).unwrap() };
}

pub fn prepare_contract_template(json_abi: &[u8]) -> Result<Contract<Http>, Box<dyn error::Error>> {
    let contract = Contract::from_json(
        DUMMY_RPC_PROVIDER.eth(),
        Address::from_str("0x0000000000000000000000000000000000000000").unwrap(),
        json_abi,
    )?;

    Ok(contract)
}

pub fn contract_encode<P, T>(
    contract: &Contract<T>,
    func: &str,
    params: P,
) -> Result<Vec<u8>, web3::ethabi::Error>
where
    P: Tokenize,
    T: Transport,
{
    contract
        .abi()
        .function(func)
        .and_then(|function| function.encode_input(&params.into_tokens()))
}

/// Calldata for the smart account's execute(dest, value, func) entry.
pub fn get_smart_account_execute(
    dest: Address,
    value: U256,
    func: Vec<u8>,
) -> Result<Vec<u8>, web3::ethabi::Error> {
    contract_encode(&SMART_ACCOUNT_CONTRACT_TEMPLATE, "execute", (dest, value, func))
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Unpacked ERC-4337 user operation (entry point v0.6 wire shape).
#[derive(Debug, Clone)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Vec<u8>,
    pub call_data: Vec<u8>,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UserOperation {
    /// The hash the bundler and entry point identify this operation by:
    /// keccak(abi.encode(keccak(packed fields), entryPoint, chainId)).
    pub fn op_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ]);
        let outer = encode(&[
            Token::FixedBytes(keccak256(&packed).to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256::from(keccak256(&outer))
    }

    /// JSON object in the form eth_sendUserOperation expects.
    pub fn to_rpc_json(&self) -> serde_json::Value {
        json!({
            "sender": format!("{:#x}", self.sender),
            "nonce": format!("{:#x}", self.nonce),
            "initCode": format!("0x{}", hex::encode(&self.init_code)),
            "callData": format!("0x{}", hex::encode(&self.call_data)),
            "callGasLimit": format!("{:#x}", self.call_gas_limit),
            "verificationGasLimit": format!("{:#x}", self.verification_gas_limit),
            "preVerificationGas": format!("{:#x}", self.pre_verification_gas),
            "maxFeePerGas": format!("{:#x}", self.max_fee_per_gas),
            "maxPriorityFeePerGas": format!("{:#x}", self.max_priority_fee_per_gas),
            "paymasterAndData": format!("0x{}", hex::encode(&self.paymaster_and_data)),
            "signature": format!("0x{}", hex::encode(&self.signature)),
        })
    }
}

/// Fields hashed into a Safe transaction proposal.
#[derive(Debug, Clone)]
pub struct SafeTxParams {
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub operation: u8,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub nonce: U256,
}

/// EIP-712 digest the owners sign when approving a Safe transaction.
pub fn safe_tx_hash(safe: Address, chain_id: u64, params: &SafeTxParams) -> H256 {
    let domain_typehash = keccak256(b"EIP712Domain(uint256 chainId,address verifyingContract)");
    let safe_tx_typehash = keccak256(
        b"SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)",
    );
    let domain_separator = keccak256(&encode(&[
        Token::FixedBytes(domain_typehash.to_vec()),
        Token::Uint(U256::from(chain_id)),
        Token::Address(safe),
    ]));
    let struct_hash = keccak256(&encode(&[
        Token::FixedBytes(safe_tx_typehash.to_vec()),
        Token::Address(params.to),
        Token::Uint(params.value),
        Token::FixedBytes(keccak256(&params.data).to_vec()),
        Token::Uint(U256::from(params.operation)),
        Token::Uint(params.safe_tx_gas),
        Token::Uint(params.base_gas),
        Token::Uint(params.gas_price),
        Token::Address(params.gas_token),
        Token::Address(params.refund_receiver),
        Token::Uint(params.nonce),
    ]));
    let mut digest_input = Vec::with_capacity(66);
    digest_input.extend_from_slice(&[0x19, 0x01]);
    digest_input.extend_from_slice(&domain_separator);
    digest_input.extend_from_slice(&struct_hash);
    H256::from(keccak256(&digest_input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_encoding_has_selector() {
        let data = get_smart_account_execute(
            Address::from_low_u64_be(1),
            U256::from(10),
            vec![0xde, 0xad],
        )
        .unwrap();
        // selector + 3 head words + one data word for the bytes tail
        assert_eq!(&data[0..4], &keccak256(b"execute(address,uint256,bytes)")[0..4]);
        assert!(data.len() > 4 + 32 * 3);
    }

    #[test]
    fn test_op_hash_depends_on_chain() {
        let op = UserOperation {
            sender: Address::from_low_u64_be(7),
            nonce: U256::zero(),
            init_code: vec![],
            call_data: vec![1, 2, 3],
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster_and_data: vec![],
            signature: vec![],
        };
        let entry_point = Address::from_low_u64_be(9);
        assert_ne!(op.op_hash(entry_point, 1), op.op_hash(entry_point, 5));
    }

    #[test]
    fn test_safe_tx_hash_changes_with_nonce() {
        let params = SafeTxParams {
            to: Address::from_low_u64_be(2),
            value: U256::zero(),
            data: vec![],
            operation: 0,
            safe_tx_gas: U256::zero(),
            base_gas: U256::zero(),
            gas_price: U256::zero(),
            gas_token: Address::zero(),
            refund_receiver: Address::zero(),
            nonce: U256::from(1),
        };
        let mut bumped = params.clone();
        bumped.nonce = U256::from(2);
        let safe = Address::from_low_u64_be(3);
        assert_ne!(safe_tx_hash(safe, 1, &params), safe_tx_hash(safe, 1, &bumped));
    }
}
