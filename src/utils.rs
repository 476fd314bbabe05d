use ethers::types::U256;

/// Format a raw token amount with the given number of decimals.
///
/// Trailing fractional zeros are dropped, so a zero balance is always `"0"`.
pub fn format_token_amount(amount: U256, decimals: u8) -> String {
    let formatted = ethers::utils::format_units(amount, decimals as u32)
        .unwrap_or_else(|_| amount.to_string());
    trim_fraction(&formatted)
}

fn trim_fraction(value: &str) -> String {
    if !value.contains('.') {
        return value.to_string();
    }
    let trimmed = value.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercase `0x`-prefixed hex form of an address, used as map key.
pub fn address_key(address: &ethers::types::Address) -> String {
    format!("{:#x}", address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    #[test]
    fn test_format_token_amount_zero() {
        assert_eq!(format_token_amount(U256::zero(), 18), "0");
    }

    #[test]
    fn test_format_token_amount_one_ether() {
        let wei = U256::from(10u64.pow(18));
        assert_eq!(format_token_amount(wei, 18), "1");
    }

    #[test]
    fn test_format_token_amount_fractional() {
        // 0.5 ETH = 5 * 10^17 wei
        let wei = U256::from(5u64) * U256::from(10u64.pow(17));
        assert_eq!(format_token_amount(wei, 18), "0.5");
    }

    #[test]
    fn test_format_token_amount_six_decimals() {
        // 1234.56 USDC
        assert_eq!(format_token_amount(U256::from(1_234_560_000u64), 6), "1234.56");
    }

    #[test]
    fn test_trim_fraction_keeps_integers() {
        assert_eq!(trim_fraction("100"), "100");
        assert_eq!(trim_fraction("100.000"), "100");
        assert_eq!(trim_fraction("0.000"), "0");
    }

    #[test]
    fn test_address_key_is_lowercase() {
        let addr: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
        assert_eq!(address_key(&addr), "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    }
}
