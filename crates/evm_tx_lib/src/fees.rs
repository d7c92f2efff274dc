use crate::error::EngineError;
use crate::model::FeeData;
use crate::utils::{gwei_to_u256, u256_percent};
use crate::{err_custom_create, err_from};
use serde::Serialize;
use web3::transports::Http;
use web3::types::{BlockId, BlockNumber, U256};
use web3::Web3;

/// Default sampling window for tiered estimates.
pub const FEE_HISTORY_WINDOW: u64 = 5;
/// Upper bound a single eth_feeHistory call is allowed to span.
pub const MAX_BLOCKS_PER_FEE_HISTORY_CALL: u64 = 1024;

const TIER_PERCENTILES: [f64; 3] = [10.0, 20.0, 30.0];
const BASE_FEE_PERCENT: [u64; 3] = [110, 120, 125];
const PRIORITY_FEE_PERCENT: [u64; 3] = [94, 97, 98];
const MIN_PRIORITY_FEE_GWEI: [f64; 3] = [1.0, 1.5, 2.0];
const WAIT_TIME_BOUNDS: [(u64, u64); 3] = [(15, 30), (15, 45), (15, 60)];

/// Priority fee assumed by the populator probe when the chain gives no
/// better signal.
const DEFAULT_PRIORITY_FEE_GWEI: f64 = 1.5;

/// One block of fee history. The node always returns one extra trailing
/// base fee for the block after the requested range; that projection never
/// carries usage or priority data, so it gets its own variant instead of a
/// half-filled sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FeeHistoryBlock {
    #[serde(rename_all = "camelCase")]
    Sample {
        number: u64,
        base_fee: U256,
        gas_used_ratio: f64,
        /// (requested percentile, priority fee paid at it), in request order.
        priority_fees: Vec<(f64, U256)>,
    },
    #[serde(rename_all = "camelCase")]
    NextBlock { number: u64, base_fee: U256 },
}

impl FeeHistoryBlock {
    pub fn base_fee(&self) -> U256 {
        match self {
            FeeHistoryBlock::Sample { base_fee, .. } => *base_fee,
            FeeHistoryBlock::NextBlock { base_fee, .. } => *base_fee,
        }
    }

    pub fn is_projection(&self) -> bool {
        matches!(self, FeeHistoryBlock::NextBlock { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTier {
    pub min_wait_time: u64,
    pub max_wait_time: u64,
    /// None on the legacy fallback shape.
    pub suggested_max_priority_fee_per_gas: Option<U256>,
    pub suggested_max_fee_per_gas: U256,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFeeEstimate {
    pub estimated_base_fee: Option<U256>,
    pub low: FeeTier,
    pub medium: FeeTier,
    pub high: FeeTier,
}

impl GasFeeEstimate {
    pub fn tiers(&self) -> [&FeeTier; 3] {
        [&self.low, &self.medium, &self.high]
    }
}

/// Split the requested window into call-sized chunks, oldest first.
fn chunk_ranges(newest_block: u64, block_count: u64, max_per_call: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let oldest = newest_block.saturating_sub(block_count.saturating_sub(1));
    let mut start = oldest;
    while start <= newest_block {
        let end = (start + max_per_call - 1).min(newest_block);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Turn one eth_feeHistory response into typed blocks. `first_block_number`
/// is the oldest block of the chunk; `append_next_block` keeps the trailing
/// projection (only meaningful for the final chunk of a window).
fn parse_fee_history_chunk(
    first_block_number: u64,
    base_fee_per_gas: &[U256],
    gas_used_ratio: &[f64],
    reward: Option<&Vec<Vec<U256>>>,
    percentiles: &[f64],
    append_next_block: bool,
) -> Result<Vec<FeeHistoryBlock>, EngineError> {
    let block_count = gas_used_ratio.len();
    let mut blocks = Vec::with_capacity(block_count + 1);
    for i in 0..block_count {
        let base_fee = *base_fee_per_gas
            .get(i)
            .ok_or_else(|| err_custom_create!("Fee history base fee missing at index {}", i))?;
        let priority_fees = match reward {
            Some(rewards) => {
                let block_rewards = rewards.get(i).ok_or_else(|| {
                    err_custom_create!("Fee history reward missing at index {}", i)
                })?;
                percentiles
                    .iter()
                    .zip(block_rewards.iter())
                    .map(|(p, fee)| (*p, *fee))
                    .collect()
            }
            None => Vec::new(),
        };
        blocks.push(FeeHistoryBlock::Sample {
            number: first_block_number + i as u64,
            base_fee,
            gas_used_ratio: gas_used_ratio[i],
            priority_fees,
        });
    }
    if append_next_block {
        if let Some(base_fee) = base_fee_per_gas.get(block_count) {
            blocks.push(FeeHistoryBlock::NextBlock {
                number: first_block_number + block_count as u64,
                base_fee: *base_fee,
            });
        }
    }
    Ok(blocks)
}

/// Fetch `block_count` blocks of fee history ending at `newest_block`.
/// Requests wider than MAX_BLOCKS_PER_FEE_HISTORY_CALL are split into
/// chunks issued concurrently and concatenated in block order. The trailing
/// next-block projection is trimmed unless `include_next_block` is set.
pub async fn fetch_fee_history(
    web3: &Web3<Http>,
    newest_block: u64,
    block_count: u64,
    percentiles: &[f64],
    include_next_block: bool,
) -> Result<Vec<FeeHistoryBlock>, EngineError> {
    if block_count == 0 {
        return Ok(Vec::new());
    }
    let ranges = chunk_ranges(newest_block, block_count, MAX_BLOCKS_PER_FEE_HISTORY_CALL);
    let mut handles = Vec::with_capacity(ranges.len());
    for (start, end) in &ranges {
        let web3 = web3.clone();
        let percentiles = percentiles.to_vec();
        let (start, end) = (*start, *end);
        handles.push(tokio::spawn(async move {
            web3.eth()
                .fee_history(
                    U256::from(end - start + 1),
                    BlockNumber::Number(end.into()),
                    Some(percentiles),
                )
                .await
        }));
    }

    let last_chunk = ranges.len() - 1;
    let mut blocks = Vec::with_capacity(block_count as usize + 1);
    for (chunk_no, handle) in handles.into_iter().enumerate() {
        let history = handle
            .await
            .map_err(|e| err_custom_create!("Fee history task failed: {}", e))?
            .map_err(err_from!())?;
        let chunk = parse_fee_history_chunk(
            ranges[chunk_no].0,
            &history.base_fee_per_gas,
            &history.gas_used_ratio,
            history.reward.as_ref(),
            percentiles,
            include_next_block && chunk_no == last_chunk,
        )?;
        blocks.extend(chunk);
    }
    Ok(blocks)
}

/// Median priority fee over the window for one percentile slot, taking the
/// lower-middle element on even counts.
fn median_priority_fee(blocks: &[FeeHistoryBlock], slot: usize) -> Option<U256> {
    let mut fees: Vec<U256> = blocks
        .iter()
        .filter_map(|block| match block {
            FeeHistoryBlock::Sample { priority_fees, .. } => {
                priority_fees.get(slot).map(|(_, fee)| *fee)
            }
            FeeHistoryBlock::NextBlock { .. } => None,
        })
        .collect();
    if fees.is_empty() {
        return None;
    }
    fees.sort();
    Some(fees[(fees.len() - 1) / 2])
}

/// Tiered suggestions from a sampled window. The base fee is padded per
/// tier so the suggestion stays viable across several blocks of base fee
/// drift without resubmission; the priority fee is the damped window median
/// with an absolute floor.
pub fn estimate_tiers(blocks: &[FeeHistoryBlock]) -> Result<GasFeeEstimate, EngineError> {
    let latest_base_fee = blocks
        .iter()
        .rev()
        .find(|block| !block.is_projection())
        .map(|block| block.base_fee())
        .ok_or_else(|| err_custom_create!("No usable blocks in fee history"))?;

    let make_tier = |slot: usize| -> Result<FeeTier, EngineError> {
        let padded_base_fee = u256_percent(latest_base_fee, BASE_FEE_PERCENT[slot]);
        let floor = gwei_to_u256(MIN_PRIORITY_FEE_GWEI[slot]).map_err(err_from!())?;
        let priority_fee = match median_priority_fee(blocks, slot) {
            Some(median) => u256_percent(median, PRIORITY_FEE_PERCENT[slot]).max(floor),
            None => floor,
        };
        Ok(FeeTier {
            min_wait_time: WAIT_TIME_BOUNDS[slot].0,
            max_wait_time: WAIT_TIME_BOUNDS[slot].1,
            suggested_max_priority_fee_per_gas: Some(priority_fee),
            suggested_max_fee_per_gas: padded_base_fee + priority_fee,
        })
    };
    Ok(GasFeeEstimate {
        estimated_base_fee: Some(latest_base_fee),
        low: make_tier(0)?,
        medium: make_tier(1)?,
        high: make_tier(2)?,
    })
}

/// Reduced shape for chains without fee history: a single gas price spread
/// into three tiers, no priority fee breakdown.
pub fn build_legacy_estimate(gas_price: U256) -> GasFeeEstimate {
    let tier = |slot: usize, percent: u64| FeeTier {
        min_wait_time: WAIT_TIME_BOUNDS[slot].0,
        max_wait_time: WAIT_TIME_BOUNDS[slot].1,
        suggested_max_priority_fee_per_gas: None,
        suggested_max_fee_per_gas: u256_percent(gas_price, percent),
    };
    GasFeeEstimate {
        estimated_base_fee: None,
        low: tier(0, 100),
        medium: tier(1, 110),
        high: tier(2, 125),
    }
}

/// Entry point: tiered estimate from recent history, or the legacy shape
/// when the chain does not serve eth_feeHistory.
pub async fn estimate_gas_fee(web3: &Web3<Http>) -> Result<GasFeeEstimate, EngineError> {
    let newest_block = crate::eth::get_latest_block_number(web3).await?;
    match fetch_fee_history(web3, newest_block, FEE_HISTORY_WINDOW, &TIER_PERCENTILES, false).await
    {
        Ok(blocks) => estimate_tiers(&blocks),
        Err(err) => {
            log::warn!(
                "Fee history not available, falling back to gas price: {}",
                err
            );
            let gas_price = web3.eth().gas_price().await.map_err(err_from!())?;
            Ok(build_legacy_estimate(gas_price))
        }
    }
}

/// Current fee fields for the populator's decision table.
pub async fn get_fee_data(web3: &Web3<Http>) -> Result<FeeData, EngineError> {
    let gas_price = web3.eth().gas_price().await.map_err(err_from!())?;
    let latest_block = web3
        .eth()
        .block(BlockId::Number(BlockNumber::Latest))
        .await
        .map_err(err_from!())?;
    let base_fee = latest_block.and_then(|block| block.base_fee_per_gas);
    match base_fee {
        Some(base_fee) => {
            let priority_fee = gwei_to_u256(DEFAULT_PRIORITY_FEE_GWEI).map_err(err_from!())?;
            Ok(FeeData {
                gas_price: Some(gas_price),
                max_fee_per_gas: Some(base_fee * 2 + priority_fee),
                max_priority_fee_per_gas: Some(priority_fee),
            })
        }
        None => Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }),
    }
}
