/// Decimal places of one coin expressed in zatoshi.
pub const ZATOSHI_DECIMALS: u32 = 8;

pub fn format_token_amount(amount: u64, decimals: u32) -> String {
    format!(
        "{:.*}",
        decimals as usize,
        amount as f64 / 10f64.powi(decimals as i32)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zatoshi() {
        assert_eq!(format_token_amount(150_000_000, ZATOSHI_DECIMALS), "1.50000000");
        assert_eq!(format_token_amount(0, 2), "0.00");
    }
}
