use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount {0} is not integral in the currency's minor unit")]
    NotIntegral(Decimal),

    #[error("Amount {0} does not fit in minor units")]
    Overflow(Decimal),
}

/// Convert an exact decimal amount into the gateway's integer minor units.
///
/// `exponent` is the number of minor-unit digits of the currency (0 for KRW, 2 for USD).
/// Amounts that would need rounding are rejected.
pub fn to_minor_units(amount: Decimal, exponent: u32) -> Result<i64, MoneyError> {
    let factor = Decimal::from(10_i64.pow(exponent));
    let scaled = amount
        .checked_mul(factor)
        .ok_or(MoneyError::Overflow(amount))?;

    if !scaled.fract().is_zero() {
        return Err(MoneyError::NotIntegral(amount));
    }

    scaled.to_i64().ok_or(MoneyError::Overflow(amount))
}
