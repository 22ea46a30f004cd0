//! End-to-end lifecycle engine tests over the in-memory store. The SQL store
//! shares the same rule modules, so these pin the engine semantics:
//! sequential-only advancement, reconciliation, audit completeness and
//! atomicity.

use optia_core::{Caller, CoreError, Role};
use optia_order::models::{NewLineItem, NewOrder, NewPayment, OrderQuery, TransitionCommand};
use optia_order::{MemoryOrderStore, OrderStatus, OrderStore};
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn new_order(patient_id: Uuid) -> NewOrder {
    NewOrder {
        patient_id,
        observations: Some("progressive lenses".into()),
        total: None,
        acuities: vec![],
        rx: vec![],
        selections: vec![],
    }
}

fn cmd(to: i16) -> TransitionCommand {
    TransitionCommand {
        to_status: to,
        note: None,
        lab_kind: None,
        lab_id: None,
        lab_name: None,
    }
}

struct Fixture {
    store: MemoryOrderStore,
    caller: Caller,
    order_id: Uuid,
}

async fn fixture() -> Fixture {
    let store = MemoryOrderStore::new();
    let tenant = Uuid::new_v4();
    let branch = store.seed_branch(tenant, "Centro");
    let patient = store.seed_patient(tenant, "Maria Lopez", Some("555-0134"));
    let caller = Caller {
        user_id: Uuid::new_v4(),
        user_name: "Ana Torres".into(),
        tenant_id: tenant,
        branch_id: branch,
        role: Role::BranchScoped(branch),
    };
    let order_id = store.create_order(&caller, new_order(patient)).await.unwrap();
    Fixture {
        store,
        caller,
        order_id,
    }
}

/// Advance an order from Created up to (and including) `target`.
async fn advance_to(f: &Fixture, target: OrderStatus) {
    for to in 1..=target.ordinal() {
        let mut c = cmd(to);
        if to == OrderStatus::SentToLab.ordinal() {
            c.lab_kind = Some("Internal".into());
        }
        f.store.transition(&f.caller, f.order_id, c).await.unwrap();
    }
}

#[tokio::test]
async fn first_transition_reports_from_and_to() {
    let f = fixture().await;
    let event = f.store.transition(&f.caller, f.order_id, cmd(1)).await.unwrap();
    assert_eq!(event.from_status, OrderStatus::Created);
    assert_eq!(event.to_status, OrderStatus::Registered);

    // Skipping ahead from Registered(1) to 3 must fail, naming both values.
    match f.store.transition(&f.caller, f.order_id, cmd(3)).await {
        Err(CoreError::IllegalTransition { current, expected }) => {
            assert_eq!(current, 1);
            assert_eq!(expected, 2);
        }
        other => panic!("{other:?}"),
    }
}

#[tokio::test]
async fn full_walk_to_delivery_and_audit_completeness() {
    let f = fixture().await;
    advance_to(&f, OrderStatus::DeliveredToCustomer).await;

    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::DeliveredToCustomer);
    assert!(detail.order.sent_to_lab_at.is_some());
    assert!(detail.order.estimated_delivery_at.is_some());
    assert!(detail.order.received_at_branch_at.is_some());
    assert!(detail.order.delivered_at.is_some());

    // One audit event per successful transition, replayed in order.
    let history = f.store.get_history(&f.caller, f.order_id).await.unwrap();
    assert_eq!(history.steps.len(), 10);
    for (i, step) in history.steps.iter().enumerate() {
        assert_eq!(step.from_status.ordinal(), i as i16);
        assert_eq!(step.to_status.ordinal(), i as i16 + 1);
    }
    assert_eq!(history.patient_name, "Maria Lopez");
}

#[tokio::test]
async fn sent_to_lab_requires_and_records_lab_kind() {
    let f = fixture().await;
    advance_to(&f, OrderStatus::ReceivedAtBranch).await;

    // Missing lab kind rejects the transition entirely.
    match f.store.transition(&f.caller, f.order_id, cmd(5)).await {
        Err(CoreError::Validation(_)) => {}
        other => panic!("{other:?}"),
    }
    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::ReceivedAtBranch);
    assert!(detail.order.sent_to_lab_at.is_none());

    let mut c = cmd(5);
    c.lab_kind = Some("Internal".into());
    c.lab_name = Some("In-house lab".into());
    f.store.transition(&f.caller, f.order_id, c).await.unwrap();
    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert!(detail.order.sent_to_lab_at.is_some());
}

#[tokio::test]
async fn forced_store_fault_leaves_order_unchanged() {
    let f = fixture().await;
    f.store.transition(&f.caller, f.order_id, cmd(1)).await.unwrap();

    f.store.fail_next_write();
    match f.store.transition(&f.caller, f.order_id, cmd(2)).await {
        Err(CoreError::TransitionFailed) => {}
        other => panic!("{other:?}"),
    }

    // No partial status/timestamp/audit writes survive the failure.
    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::Registered);
    let history = f.store.get_history(&f.caller, f.order_id).await.unwrap();
    assert_eq!(history.steps.len(), 1);

    // The caller retries from the pre-transition state.
    f.store.transition(&f.caller, f.order_id, cmd(2)).await.unwrap();
}

#[tokio::test]
async fn reconciliation_scenario() {
    let f = fixture().await;

    let items = vec![
        NewLineItem {
            label: "Exam".into(),
            amount: dec("50.00"),
            note: None,
        },
        NewLineItem {
            label: "Frame".into(),
            amount: dec("120.00"),
            note: None,
        },
    ];
    let view = f
        .store
        .replace_line_items(&f.caller, f.order_id, items)
        .await
        .unwrap();
    assert_eq!(view.total, dec("170.00"));

    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.total, Some(dec("170.00")));
    assert_eq!(detail.order.amount_paid, dec("0.00"));
    assert_eq!(detail.order.balance_due, dec("170.00"));

    f.store
        .add_payments(
            &f.caller,
            f.order_id,
            vec![NewPayment {
                method: "Cash".into(),
                amount: dec("100.00"),
                authorization: None,
                note: None,
            }],
        )
        .await
        .unwrap();

    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.amount_paid, dec("100.00"));
    assert_eq!(detail.order.balance_due, dec("70.00"));
}

#[tokio::test]
async fn replacing_line_items_keeps_recorded_payments_in_balance() {
    let f = fixture().await;
    f.store
        .replace_line_items(
            &f.caller,
            f.order_id,
            vec![NewLineItem {
                label: "Exam".into(),
                amount: dec("50.00"),
                note: None,
            }],
        )
        .await
        .unwrap();
    f.store
        .add_payments(
            &f.caller,
            f.order_id,
            vec![NewPayment {
                method: "card".into(),
                amount: dec("30.00"),
                authorization: Some("A-1021".into()),
                note: None,
            }],
        )
        .await
        .unwrap();

    // Re-pricing re-sums existing payments instead of zeroing them.
    f.store
        .replace_line_items(
            &f.caller,
            f.order_id,
            vec![NewLineItem {
                label: "Exam + coating".into(),
                amount: dec("80.00"),
                note: None,
            }],
        )
        .await
        .unwrap();
    let detail = f.store.get_order(&f.caller, f.order_id).await.unwrap();
    assert_eq!(detail.order.total, Some(dec("80.00")));
    assert_eq!(detail.order.amount_paid, dec("30.00"));
    assert_eq!(detail.order.balance_due, dec("50.00"));
}

#[tokio::test]
async fn invalid_payment_method_rejects_the_whole_batch() {
    let f = fixture().await;
    let result = f
        .store
        .add_payments(
            &f.caller,
            f.order_id,
            vec![
                NewPayment {
                    method: "Cash".into(),
                    amount: dec("10.00"),
                    authorization: None,
                    note: None,
                },
                NewPayment {
                    method: "Barter".into(),
                    amount: dec("5.00"),
                    authorization: None,
                    note: None,
                },
            ],
        )
        .await;
    match result {
        Err(CoreError::Validation(msg)) => assert!(msg.contains("Barter")),
        other => panic!("{other:?}"),
    }
    let payments = f.store.list_payments(&f.caller, f.order_id).await.unwrap();
    assert!(payments.is_empty(), "nothing may be appended");
}

#[tokio::test]
async fn visibility_is_identical_for_reads_and_writes() {
    let f = fixture().await;

    // A caller from another branch of the same tenant sees nothing.
    let other_branch = f.store.seed_branch(f.caller.tenant_id, "Norte");
    let outsider = Caller {
        user_id: Uuid::new_v4(),
        user_name: "Luis Vega".into(),
        tenant_id: f.caller.tenant_id,
        branch_id: other_branch,
        role: Role::BranchScoped(other_branch),
    };
    assert!(matches!(
        f.store.get_order(&outsider, f.order_id).await,
        Err(CoreError::NotFound)
    ));
    assert!(matches!(
        f.store.transition(&outsider, f.order_id, cmd(1)).await,
        Err(CoreError::NotFound)
    ));
    assert!(matches!(
        f.store.get_history(&outsider, f.order_id).await,
        Err(CoreError::NotFound)
    ));

    // An admin of the same tenant sees everything.
    let admin = Caller {
        role: Role::Admin,
        ..outsider.clone()
    };
    assert!(f.store.get_order(&admin, f.order_id).await.is_ok());

    // A courier only sees orders staged for dispatch.
    let courier = Caller {
        role: Role::Courier,
        ..outsider.clone()
    };
    assert!(matches!(
        f.store.get_order(&courier, f.order_id).await,
        Err(CoreError::NotFound)
    ));
    advance_to(&f, OrderStatus::ReadyForDispatch).await;
    assert!(f.store.get_order(&courier, f.order_id).await.is_ok());
    // And may advance them from any branch.
    f.store.transition(&courier, f.order_id, cmd(3)).await.unwrap();
}

#[tokio::test]
async fn tenants_are_isolated() {
    let f = fixture().await;
    let foreign_tenant = Uuid::new_v4();
    let foreign_branch = f.store.seed_branch(foreign_tenant, "Elsewhere");
    let foreign_admin = Caller {
        user_id: Uuid::new_v4(),
        user_name: "Eve".into(),
        tenant_id: foreign_tenant,
        branch_id: foreign_branch,
        role: Role::Admin,
    };
    // Even an admin of another tenant gets NotFound on a correct id.
    assert!(matches!(
        f.store.get_order(&foreign_admin, f.order_id).await,
        Err(CoreError::NotFound)
    ));
    assert!(matches!(
        f.store.transition(&foreign_admin, f.order_id, cmd(1)).await,
        Err(CoreError::NotFound)
    ));
    let page = f
        .store
        .list_orders(&foreign_admin, OrderQuery {
            page: 1,
            page_size: 20,
            search: None,
            status: None,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn list_orders_search_and_lab_tail() {
    let f = fixture().await;
    advance_to(&f, OrderStatus::SentToLab).await;

    let page = f
        .store
        .list_orders(&f.caller, OrderQuery {
            page: 1,
            page_size: 20,
            search: Some("lopez".into()),
            status: None,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    let row = &page.items[0];
    assert_eq!(row.status, OrderStatus::SentToLab);
    assert!(row.lab_kind.is_some());
    assert!(row.last_status_at.is_some());

    let miss = f
        .store
        .list_orders(&f.caller, OrderQuery {
            page: 1,
            page_size: 20,
            search: Some("nobody".into()),
            status: None,
        })
        .await
        .unwrap();
    assert_eq!(miss.total, 0);

    let board = f.store.list_at_lab(&f.caller, 100).await.unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].patient_name, "Maria Lopez");
}

#[tokio::test]
async fn unauthenticated_caller_cannot_transition() {
    let f = fixture().await;
    let anonymous = Caller {
        user_id: Uuid::nil(),
        user_name: String::new(),
        ..f.caller.clone()
    };
    assert!(matches!(
        f.store.transition(&anonymous, f.order_id, cmd(1)).await,
        Err(CoreError::Unauthenticated)
    ));
}
