//! Pure reconciliation arithmetic: the amount-paid and balance-due snapshot
//! persisted on an order must always be recomputable from its line items and
//! payments. Both stores call through here so the invariant cannot drift.

use optia_core::{CoreError, CoreResult};
use rust_decimal::Decimal;

use crate::models::{NewLineItem, NewPayment, Payment, PaymentMethod};

/// Reject a replacement set before anything is deleted: the set must be
/// non-empty, every label non-blank and every amount non-negative.
pub fn validate_line_items(items: &[NewLineItem]) -> CoreResult<()> {
    if items.is_empty() {
        return Err(CoreError::Validation(
            "At least one line item is required".into(),
        ));
    }
    for item in items {
        if item.label.trim().is_empty() {
            return Err(CoreError::Validation(
                "Every line item must have a label".into(),
            ));
        }
        if item.amount < Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "Line item '{}' cannot have a negative amount",
                item.label.trim()
            )));
        }
    }
    Ok(())
}

pub fn line_items_total(items: &[NewLineItem]) -> Decimal {
    items.iter().map(|i| i.amount).sum()
}

/// Parse every submitted payment method up front; a single malformed entry
/// rejects the whole batch, naming the offending method.
pub fn parse_payment_methods(payments: &[NewPayment]) -> CoreResult<Vec<PaymentMethod>> {
    payments
        .iter()
        .map(|p| {
            PaymentMethod::parse(&p.method).ok_or_else(|| {
                CoreError::Validation(format!("Invalid method in payment: {}", p.method))
            })
        })
        .collect()
}

pub fn payments_total(payments: &[Payment]) -> Decimal {
    payments.iter().map(|p| p.amount).sum()
}

/// `balance_due` is derived, never set directly.
pub fn balance_due(total: Option<Decimal>, amount_paid: Decimal) -> Decimal {
    total.unwrap_or(Decimal::ZERO) - amount_paid
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn item(label: &str, amount: &str) -> NewLineItem {
        NewLineItem {
            label: label.into(),
            amount: dec(amount),
            note: None,
        }
    }

    #[test]
    fn rejects_empty_blank_and_negative() {
        assert!(matches!(
            validate_line_items(&[]),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            validate_line_items(&[item("  ", "10.00")]),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            validate_line_items(&[item("Exam", "-0.01")]),
            Err(CoreError::Validation(_))
        ));
        assert!(validate_line_items(&[item("Exam", "0.00")]).is_ok());
    }

    #[test]
    fn totals_sum_exactly() {
        let items = vec![item("Exam", "50.00"), item("Frame", "120.00")];
        assert_eq!(line_items_total(&items), dec("170.00"));
    }

    #[test]
    fn bad_payment_method_names_the_entry() {
        let payments = vec![
            NewPayment {
                method: "Cash".into(),
                amount: dec("100.00"),
                authorization: None,
                note: None,
            },
            NewPayment {
                method: "Cheque".into(),
                amount: dec("20.00"),
                authorization: None,
                note: None,
            },
        ];
        match parse_payment_methods(&payments) {
            Err(CoreError::Validation(msg)) => assert!(msg.contains("Cheque"), "{msg}"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn balance_treats_missing_total_as_zero() {
        assert_eq!(balance_due(None, dec("25.00")), dec("-25.00"));
        assert_eq!(balance_due(Some(dec("170.00")), dec("100.00")), dec("70.00"));
    }
}
