use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Smallest currency unit.
pub const CENT: Decimal = dec!(0.01);

/// Quantize to cents, rounding away from zero.
///
/// Settlement rounding is always upward: the platform never under-delivers
/// due to truncation, at the cost of at most a cent of over-allocation that
/// the leeway adjustment claws back.
pub fn round_up(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
}
