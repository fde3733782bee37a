//! Guard table for the store order workflow.
//!
//! Every state change of a store order goes through [`next_status`], and
//! [`apply`] persists it with a conditional update on the observed state.

use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Expr, SimpleExpr},
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use uuid::Uuid;

use crate::entities::{store_order, StoreOrderStatus};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrderAction {
    Accept,
    Reject,
    Pay,
    /// Implicit follow-up once the escrow holds the funds
    BeginProcessing,
    MarkOutForDelivery,
    Deliver,
    Cancel,
}

impl StoreOrderAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Pay => "pay",
            Self::BeginProcessing => "begin processing",
            Self::MarkOutForDelivery => "go out for delivery",
            Self::Deliver => "deliver",
            Self::Cancel => "cancel",
        }
    }
}

/// Returns the state `action` moves a store order to from `current`, or the
/// conflict explaining why it cannot.
pub fn next_status(
    store_order_id: Uuid,
    current: StoreOrderStatus,
    action: StoreOrderAction,
) -> Result<StoreOrderStatus, ServiceError> {
    use StoreOrderAction as A;
    use StoreOrderStatus as S;

    match (current, action) {
        (S::Pending, A::Accept) => Ok(S::Accepted),
        (S::Pending, A::Reject) => Ok(S::Rejected),
        (S::Accepted, A::Pay) => Ok(S::Paid),
        (s, A::Pay) if s.is_paid_or_later() => Err(ServiceError::AlreadyPaid {
            store_order_id,
            current: s,
        }),
        (s, A::Pay) => Err(ServiceError::OrderNotAccepted {
            store_order_id,
            current: s,
        }),
        (S::Paid, A::BeginProcessing) => Ok(S::Processing),
        (S::Processing, A::MarkOutForDelivery) => Ok(S::OutForDelivery),
        (S::OutForDelivery, A::Deliver) => Ok(S::Delivered),
        (S::Pending | S::Accepted, A::Cancel) => Ok(S::Cancelled),
        (s, action) => Err(ServiceError::InvalidTransition {
            store_order_id,
            action: action.as_str(),
            current: s,
        }),
    }
}

/// Applies `action` to `so` as a compare-and-swap on its observed status,
/// setting `columns` alongside the new status.
///
/// When the swap misses, the store order is re-read so the error names the
/// state the winner left behind: the guard's own error when the action is no
/// longer allowed, otherwise `Conflict`.
pub async fn apply<C: ConnectionTrait>(
    conn: &C,
    so: &store_order::Model,
    action: StoreOrderAction,
    now: DateTime<Utc>,
    columns: Vec<(store_order::Column, SimpleExpr)>,
) -> Result<StoreOrderStatus, ServiceError> {
    let to = next_status(so.id, so.status, action)?;

    let mut update = store_order::Entity::update_many()
        .col_expr(store_order::Column::Status, Expr::value(to))
        .col_expr(store_order::Column::UpdatedAt, Expr::value(now));
    for (column, value) in columns {
        update = update.col_expr(column, value);
    }
    let result = update
        .filter(store_order::Column::Id.eq(so.id))
        .filter(store_order::Column::Status.eq(so.status))
        .exec(conn)
        .await?;

    if result.rows_affected == 1 {
        return Ok(to);
    }

    let current = store_order::Entity::find_by_id(so.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Store order {} not found", so.id)))?;
    next_status(so.id, current.status, action)?;
    Err(ServiceError::Conflict(format!(
        "Store order {} changed while trying to {}",
        so.id,
        action.as_str()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    use StoreOrderAction as A;
    use StoreOrderStatus as S;

    const ALL: [StoreOrderStatus; 8] = [
        S::Pending,
        S::Accepted,
        S::Rejected,
        S::Paid,
        S::Processing,
        S::OutForDelivery,
        S::Delivered,
        S::Cancelled,
    ];

    #[rstest]
    #[case(S::Pending, A::Accept, S::Accepted)]
    #[case(S::Pending, A::Reject, S::Rejected)]
    #[case(S::Accepted, A::Pay, S::Paid)]
    #[case(S::Paid, A::BeginProcessing, S::Processing)]
    #[case(S::Processing, A::MarkOutForDelivery, S::OutForDelivery)]
    #[case(S::OutForDelivery, A::Deliver, S::Delivered)]
    #[case(S::Pending, A::Cancel, S::Cancelled)]
    #[case(S::Accepted, A::Cancel, S::Cancelled)]
    fn allowed_transitions(
        #[case] from: StoreOrderStatus,
        #[case] action: StoreOrderAction,
        #[case] to: StoreOrderStatus,
    ) {
        assert_eq!(next_status(Uuid::new_v4(), from, action).unwrap(), to);
    }

    #[test]
    fn paying_twice_reports_already_paid() {
        for current in [S::Paid, S::Processing, S::OutForDelivery, S::Delivered] {
            assert_matches!(
                next_status(Uuid::new_v4(), current, A::Pay),
                Err(ServiceError::AlreadyPaid { current: c, .. }) if c == current
            );
        }
    }

    #[test]
    fn paying_before_acceptance_reports_not_accepted() {
        for current in [S::Pending, S::Rejected, S::Cancelled] {
            assert_matches!(
                next_status(Uuid::new_v4(), current, A::Pay),
                Err(ServiceError::OrderNotAccepted { current: c, .. }) if c == current
            );
        }
    }

    #[test]
    fn accept_and_reject_only_from_pending() {
        for current in ALL.into_iter().filter(|s| *s != S::Pending) {
            for action in [A::Accept, A::Reject] {
                assert_matches!(
                    next_status(Uuid::new_v4(), current, action),
                    Err(ServiceError::InvalidTransition { current: c, .. }) if c == current
                );
            }
        }
    }

    #[test]
    fn cancel_closed_once_paid() {
        for current in [
            S::Paid,
            S::Processing,
            S::OutForDelivery,
            S::Delivered,
            S::Rejected,
            S::Cancelled,
        ] {
            assert!(next_status(Uuid::new_v4(), current, A::Cancel).is_err());
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let actions = [
            A::Accept,
            A::Reject,
            A::BeginProcessing,
            A::MarkOutForDelivery,
            A::Deliver,
            A::Cancel,
        ];
        for current in ALL.into_iter().filter(|s| s.is_terminal()) {
            for action in actions {
                assert!(next_status(Uuid::new_v4(), current, action).is_err());
            }
        }
    }

    #[test]
    fn conflicts_carry_the_observed_state() {
        let err = next_status(Uuid::new_v4(), S::Processing, A::Deliver).unwrap_err();
        assert_eq!(err.current_status(), Some(S::Processing));
        assert!(err.to_string().contains("cannot deliver while processing"));
    }
}
