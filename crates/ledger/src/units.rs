//! Conversion between operator-facing decimal amounts and the asset's
//! smallest indivisible unit. All wire amounts are `u64` base units; the
//! decimal form exists only at configuration and display edges.

use rust_decimal::Decimal;

/// Convert a decimal asset amount (e.g. `0.01` USDC) to base units for
/// an asset with `decimals` fractional digits.
///
/// Returns `None` on overflow, on a negative amount, or when the amount
/// has more fractional digits than the asset supports (a lossy charge
/// amount is a configuration error, not something to round silently).
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<u64> {
    if amount.is_sign_negative() {
        return None;
    }
    let mut scale = Decimal::ONE;
    for _ in 0..decimals {
        scale = scale.checked_mul(Decimal::TEN)?;
    }
    let scaled = amount.checked_mul(scale)?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    u64::try_from(scaled.mantissa() / 10i128.pow(scaled.scale())).ok()
}

/// Render base units back as a decimal amount.
pub fn from_base_units(units: u64, decimals: u32) -> Decimal {
    let mut d = Decimal::from(units);
    d.set_scale(decimals).unwrap_or_default();
    d.normalize()
}
