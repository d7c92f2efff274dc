use rust_decimal::Decimal;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use web3::types::U256;

#[derive(Debug, Clone)]
pub struct ConversionError {
    pub msg: String,
}

impl ConversionError {
    pub fn from(msg: String) -> Self {
        Self { msg }
    }
}

impl Display for ConversionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error during conversion: {}", self.msg)
    }
}

impl Error for ConversionError {
    fn description(&self) -> &str {
        "Conversion error"
    }
}

pub fn gwei_to_u256(gwei: f64) -> Result<U256, ConversionError> {
    pub const GWEI: f64 = 1.0E9;
    if gwei < 0.0 {
        return Err(ConversionError {
            msg: "Gas price cannot be negative".to_string(),
        });
    }
    if gwei > 1.0E9 {
        return Err(ConversionError {
            msg: "Gas price cannot be greater than 1E9".to_string(),
        });
    }
    if gwei.is_nan() {
        return Err(ConversionError {
            msg: "Gas price cannot be NaN".to_string(),
        });
    }
    Ok(U256::from((gwei * GWEI) as u64))
}

pub fn u256_to_rust_dec(amount: U256, decimals: Option<u32>) -> Result<Decimal, ConversionError> {
    let decimals = decimals.unwrap_or(18);
    if decimals > 28 {
        return Err(ConversionError {
            msg: format!("Decimals {} cannot be greater than 28", decimals),
        });
    }
    let mut dec = Decimal::from_str(&amount.to_string()).map_err(|_| ConversionError {
        msg: format!("Amount {} out of decimal range", amount),
    })?;
    dec.set_scale(decimals).map_err(|_| ConversionError {
        msg: format!("Cannot set scale {} on amount {}", decimals, amount),
    })?;
    Ok(dec)
}

/// Multiply by percent / 100 without leaving integer math.
pub fn u256_percent(value: U256, percent: u64) -> U256 {
    value * U256::from(percent) / U256::from(100)
}

pub fn trim_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gwei_to_u256() {
        assert_eq!(gwei_to_u256(1.0).unwrap(), U256::from(1_000_000_000u64));
        assert_eq!(gwei_to_u256(1.5).unwrap(), U256::from(1_500_000_000u64));
        assert!(gwei_to_u256(-1.0).is_err());
        assert!(gwei_to_u256(f64::NAN).is_err());
    }

    #[test]
    fn test_u256_to_rust_dec() {
        let dec = u256_to_rust_dec(U256::from(1_500_000_000_000_000_000u64), None).unwrap();
        assert_eq!(dec.to_string(), "1.500000000000000000");
    }

    #[test]
    fn test_u256_percent() {
        assert_eq!(u256_percent(U256::from(200), 110), U256::from(220));
        assert_eq!(u256_percent(U256::from(0), 125), U256::zero());
    }
}
