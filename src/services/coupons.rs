use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    entities::{
        coupon::{self, DiscountType},
        coupon_redemption,
    },
    errors::ServiceError,
};

/// Outcome of checking a coupon against an order subtotal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponValidation {
    pub valid: bool,
    pub coupon_id: Option<Uuid>,
    pub discount_amount: Decimal,
    pub message: String,
}

impl CouponValidation {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            coupon_id: None,
            discount_amount: Decimal::ZERO,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCouponInput {
    #[validate(length(min = 3, max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub min_order_amount: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub per_user_limit: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    #[instrument(skip(self))]
    pub async fn create_coupon(
        &self,
        input: CreateCouponInput,
    ) -> Result<coupon::Model, ServiceError> {
        input.validate()?;
        if input.value <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Coupon value must be positive".to_string(),
            ));
        }
        if input.discount_type == DiscountType::Percent && input.value > Decimal::ONE_HUNDRED {
            return Err(ServiceError::ValidationError(
                "Percentage coupons cannot exceed 100".to_string(),
            ));
        }

        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(normalize_code(&input.code)),
            discount_type: Set(input.discount_type),
            value: Set(input.value),
            min_order_amount: Set(input.min_order_amount),
            max_discount: Set(input.max_discount),
            usage_limit: Set(input.usage_limit),
            per_user_limit: Set(input.per_user_limit),
            times_used: Set(0),
            starts_at: Set(input.starts_at),
            expires_at: Set(input.expires_at),
            is_active: Set(true),
            created_at: Set(self.clock.now()),
        }
        .insert(&*self.db)
        .await?;

        info!(coupon_id = %coupon.id, code = %coupon.code, "Created coupon");
        Ok(coupon)
    }

    /// Checks a coupon for `buyer_id` against an order-level subtotal.
    pub async fn validate(
        &self,
        code: &str,
        buyer_id: Uuid,
        subtotal: Decimal,
    ) -> Result<CouponValidation, ServiceError> {
        self.validate_with(&*self.db, code, buyer_id, subtotal).await
    }

    pub async fn validate_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        buyer_id: Uuid,
        subtotal: Decimal,
    ) -> Result<CouponValidation, ServiceError> {
        let code = normalize_code(code);
        let Some(coupon) = coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code.as_str()))
            .one(conn)
            .await?
        else {
            return Ok(CouponValidation::rejected(format!("Coupon {} does not exist", code)));
        };

        let now = self.clock.now();
        if !coupon.is_active {
            return Ok(CouponValidation::rejected("Coupon is no longer active"));
        }
        if coupon.starts_at.is_some_and(|at| now < at) {
            return Ok(CouponValidation::rejected("Coupon is not active yet"));
        }
        if coupon.expires_at.is_some_and(|at| now >= at) {
            return Ok(CouponValidation::rejected("Coupon has expired"));
        }
        if coupon
            .usage_limit
            .is_some_and(|limit| coupon.times_used >= limit)
        {
            return Ok(CouponValidation::rejected("Coupon usage limit reached"));
        }
        if let Some(limit) = coupon.per_user_limit {
            let used = coupon_redemption::Entity::find()
                .filter(coupon_redemption::Column::CouponId.eq(coupon.id))
                .filter(coupon_redemption::Column::UserId.eq(buyer_id))
                .count(conn)
                .await?;
            if used >= limit.max(0) as u64 {
                return Ok(CouponValidation::rejected(
                    "Coupon already used the maximum number of times",
                ));
            }
        }
        if let Some(min) = coupon.min_order_amount {
            if subtotal < min {
                debug!(%subtotal, %min, "Subtotal below coupon minimum");
                return Ok(CouponValidation::rejected(format!(
                    "Order subtotal must be at least {}",
                    min
                )));
            }
        }

        let discount_amount = calculate_discount(&coupon, subtotal);
        Ok(CouponValidation {
            valid: true,
            coupon_id: Some(coupon.id),
            discount_amount,
            message: "Coupon applied".to_string(),
        })
    }

    /// Books one use of a coupon against an order. The usage counter only moves
    /// while it is below the limit.
    pub async fn record_redemption<C: ConnectionTrait>(
        &self,
        conn: &C,
        coupon_id: Uuid,
        buyer_id: Uuid,
        order_id: Uuid,
        discount_amount: Decimal,
    ) -> Result<(), ServiceError> {
        let result = coupon::Entity::update_many()
            .col_expr(
                coupon::Column::TimesUsed,
                Expr::col(coupon::Column::TimesUsed).add(1),
            )
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(
                Condition::any().add(coupon::Column::UsageLimit.is_null()).add(
                    Expr::col(coupon::Column::TimesUsed)
                        .lt(Expr::col(coupon::Column::UsageLimit)),
                ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Coupon usage limit reached".to_string(),
            ));
        }

        coupon_redemption::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon_id),
            user_id: Set(buyer_id),
            order_id: Set(order_id),
            discount_amount: Set(discount_amount),
            created_at: Set(self.clock.now()),
        }
        .insert(conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn deactivate(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        let coupon = coupon::Entity::find_by_id(coupon_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;
        let mut active: coupon::ActiveModel = coupon.into();
        active.is_active = Set(false);
        active.update(&*self.db).await?;
        Ok(())
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount for `subtotal`, capped by the coupon maximum and the subtotal itself.
pub fn calculate_discount(coupon: &coupon::Model, subtotal: Decimal) -> Decimal {
    let raw = match coupon.discount_type {
        DiscountType::Percent => subtotal * coupon.value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => coupon.value,
    };
    let capped = match coupon.max_discount {
        Some(max) => raw.min(max),
        None => raw,
    };
    capped
        .min(subtotal)
        .max(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SPRING".into(),
            discount_type,
            value,
            min_order_amount: None,
            max_discount: None,
            usage_limit: None,
            per_user_limit: None,
            times_used: 0,
            starts_at: None,
            expires_at: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percent_discount_rounds_to_cents() {
        let c = coupon(DiscountType::Percent, dec!(15));
        assert_eq!(calculate_discount(&c, dec!(33.33)), dec!(5.00));
        assert_eq!(calculate_discount(&c, dec!(100.00)), dec!(15.00));
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let c = coupon(DiscountType::Fixed, dec!(25.00));
        assert_eq!(calculate_discount(&c, dec!(10.00)), dec!(10.00));
        assert_eq!(calculate_discount(&c, dec!(80.00)), dec!(25.00));
    }

    #[test]
    fn maximum_discount_caps_percentages() {
        let mut c = coupon(DiscountType::Percent, dec!(50));
        c.max_discount = Some(dec!(20.00));
        assert_eq!(calculate_discount(&c, dec!(100.00)), dec!(20.00));
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert_eq!(normalize_code("  spring24 "), "SPRING24");
    }
}
