//! Proportional split of an order-level discount across store orders.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::ServiceError;

/// Splits `discount` across `subtotals` by subtotal share.
///
/// Each share is rounded down to cents; the residual goes to the first store
/// order, spilling to the next ones only where a share would exceed its
/// subtotal. The result always sums to `discount` exactly.
pub fn allocate_discount(
    subtotals: &[Decimal],
    discount: Decimal,
) -> Result<Vec<Decimal>, ServiceError> {
    if discount.is_sign_negative() {
        return Err(ServiceError::ValidationError(format!(
            "Discount cannot be negative: {}",
            discount
        )));
    }
    if subtotals.iter().any(|s| s.is_sign_negative()) {
        return Err(ServiceError::ValidationError(
            "Subtotals cannot be negative".to_string(),
        ));
    }

    let total: Decimal = subtotals.iter().copied().sum();
    if discount > total {
        return Err(ServiceError::ValidationError(format!(
            "Discount {} exceeds items total {}",
            discount, total
        )));
    }
    if discount.is_zero() {
        return Ok(vec![Decimal::ZERO; subtotals.len()]);
    }

    let mut shares: Vec<Decimal> = subtotals
        .iter()
        .map(|s| (discount * *s / total).round_dp_with_strategy(2, RoundingStrategy::ToZero))
        .collect();

    let mut residual = discount - shares.iter().copied().sum::<Decimal>();
    for (share, subtotal) in shares.iter_mut().zip(subtotals) {
        if residual.is_zero() {
            break;
        }
        let room = *subtotal - *share;
        let take = residual.min(room);
        *share += take;
        residual -= take;
    }

    Ok(shares)
}
