mod common;

use billing_gateway::database::models::{BillingCycle, SubscriptionStatus, TransactionType};
use billing_gateway::database::BillingRepository;
use billing_gateway::payments::types::PaymentState;
use billing_gateway::services::invoice_numbering::month_prefix;
use billing_gateway::services::{OrchestratorConfig, OrchestratorError, WebhookOutcome};
use chrono::{Duration as ChronoDuration, Utc};
use common::{fake_webhook, harness, harness_with, seed_processing, seed_subscription_payment};
use common::FAKE_SIGNATURE;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

fn within(actual: chrono::DateTime<Utc>, expected: chrono::DateTime<Utc>) -> bool {
    (actual - expected).num_seconds().abs() < 60
}

#[tokio::test]
async fn first_subscription_payment_activates_and_invoices() {
    let h = harness();
    let (_package, subscription, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;

    let outcome = h
        .orchestrator
        .create_payment_for_transaction(transaction.id, None)
        .await
        .expect("payment created");
    assert_eq!(outcome.status, PaymentState::Pending);
    let reference = outcome.provider_reference.expect("provider reference");

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Processing);
    assert_eq!(stored.provider.as_deref(), Some("midtrans"));
    assert_eq!(stored.external_id.as_deref(), Some(reference.as_str()));
    assert!(stored.payment_url.is_some());

    let payload = fake_webhook(transaction.id, &reference, "completed", 990_000);
    let result = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .expect("webhook");
    assert_eq!(
        result,
        WebhookOutcome::Applied {
            transaction_id: transaction.id,
            status: PaymentState::Completed
        }
    );

    let completed = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(completed.status, PaymentState::Completed);
    assert!(completed.paid_at.is_some());

    let invoices = h.repo.invoices().await;
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert_eq!(completed.invoice_id, Some(invoice.id));
    assert_eq!(invoice.transaction_id, transaction.id);
    assert_eq!(invoice.total, 990_000);
    assert_eq!(invoice.subscription_id, Some(subscription.id));
    assert_eq!(
        invoice.invoice_number,
        format!("{}0001", month_prefix(Utc::now()))
    );

    let activated = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(activated.status, SubscriptionStatus::Active);
    assert!(activated.start_date.is_some());
    let end_date = activated.end_date.expect("end date");
    assert!(within(end_date, Utc::now() + ChronoDuration::days(30)));
}

#[tokio::test]
async fn redelivered_webhook_is_a_duplicate_without_effects() {
    let h = harness();
    let (_, subscription, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;
    let payload = fake_webhook(transaction.id, "MTX123", "completed", 990_000);

    let first = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert!(matches!(first, WebhookOutcome::Applied { .. }));
    let after_first = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();

    let second = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        second,
        WebhookOutcome::Duplicate {
            transaction_id: transaction.id
        }
    );
    assert!(second.acknowledged());

    assert_eq!(h.repo.invoices().await.len(), 1);
    let after_second = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(after_first.end_date, after_second.end_date);
    assert_eq!(after_first.updated_at, after_second.updated_at);
}

#[tokio::test]
async fn completion_of_pending_transaction_passes_through_processing() {
    let h = harness();
    let (_, _, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;

    let update = billing_gateway::services::payment_orchestrator::StatusUpdate::new(
        PaymentState::Completed,
        serde_json::json!({}),
    );
    let outcome = h
        .orchestrator
        .apply_status_update(transaction.clone(), update)
        .await
        .unwrap();

    match outcome {
        billing_gateway::services::TransitionOutcome::Applied {
            transaction,
            first_completion,
        } => {
            assert!(first_completion);
            assert_eq!(transaction.status, PaymentState::Completed);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn refund_then_cancel_is_rejected() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-REFUND").await;
    let payload = fake_webhook(transaction.id, "MTX-REFUND", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    let refunded = h
        .orchestrator
        .refund_payment(transaction.id, None, Some("duplicate charge".to_string()))
        .await
        .expect("refund");
    assert_eq!(refunded.status, PaymentState::Refunded);
    let refund = refunded.refund.expect("refund details");
    assert_eq!(refund.amount, 150_000);
    assert_eq!(refund.reason.as_deref(), Some("duplicate charge"));

    let calls_before = h.provider.calls.load(Ordering::SeqCst);
    let err = h.orchestrator.cancel_payment(transaction.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: PaymentState::Refunded,
            to: PaymentState::Cancelled
        }
    ));
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn refund_requires_completed_status_and_valid_amount() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-R2").await;

    let err = h
        .orchestrator
        .refund_payment(transaction.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

    let payload = fake_webhook(transaction.id, "MTX-R2", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .refund_payment(transaction.id, Some(150_001), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidRefundAmount {
            requested: 150_001,
            available: 150_000
        }
    ));

    let partial = h
        .orchestrator
        .refund_payment(transaction.id, Some(50_000), None)
        .await
        .unwrap();
    assert_eq!(partial.refund.map(|r| r.amount), Some(50_000));
}

#[tokio::test]
async fn unsettled_refund_keeps_payment_completed_until_notified() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-R3").await;
    let payload = fake_webhook(transaction.id, "MTX-R3", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    h.provider.set_refund_status(PaymentState::Processing);
    let accepted = h
        .orchestrator
        .refund_payment(transaction.id, Some(40_000), Some("downgrade".to_string()))
        .await
        .expect("refund accepted");
    assert_eq!(accepted.status, PaymentState::Completed);
    assert!(accepted.refund.is_none());
    assert_eq!(
        accepted.gateway_response.as_ref().and_then(|r| r["status"].as_str()),
        Some("processing")
    );

    let notification = serde_json::to_vec(&serde_json::json!({
        "id": "MTX-R3",
        "order_id": transaction.id.to_string(),
        "status": "refunded",
        "amount": 150_000,
        "refund_amount": 40_000,
        "reason": "downgrade"
    }))
    .unwrap();
    let result = h
        .orchestrator
        .process_webhook("midtrans", &notification, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        result,
        WebhookOutcome::Applied {
            transaction_id: transaction.id,
            status: PaymentState::Refunded
        }
    );

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Refunded);
    let refund = stored.refund.expect("refund details");
    assert_eq!(refund.amount, 40_000);
    assert_eq!(refund.reason.as_deref(), Some("downgrade"));
}

#[tokio::test]
async fn provider_refund_failure_is_a_gateway_error() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-R4").await;
    let payload = fake_webhook(transaction.id, "MTX-R4", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    h.provider.set_refund_status(PaymentState::Failed);
    let err = h
        .orchestrator
        .refund_payment(transaction.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::GatewayError { .. }));

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Completed);
}

#[tokio::test]
async fn refund_webhook_without_amount_records_full_refund() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-R5").await;
    let completed = fake_webhook(transaction.id, "MTX-R5", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &completed, FAKE_SIGNATURE)
        .await
        .unwrap();

    let refunded = fake_webhook(transaction.id, "MTX-R5", "refunded", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &refunded, FAKE_SIGNATURE)
        .await
        .unwrap();

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Refunded);
    let refund = stored.refund.expect("refund details");
    assert_eq!(refund.amount, 150_000);
    assert_eq!(refund.reason, None);
}

#[tokio::test]
async fn monthly_renewal_extends_period_and_resets_usage() {
    let h = harness();
    let (_, subscription, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Renewal,
        SubscriptionStatus::PastDue,
    )
    .await;
    let mut past_due = subscription.clone();
    past_due.renewal_attempts = 2;
    h.repo.insert_subscription(past_due).await;

    let payload = fake_webhook(transaction.id, "MTX-RENEW-M", "completed", 990_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    let renewed = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.renewal_attempts, 0);
    let next = renewed.next_billing_date.expect("next billing date");
    assert!(within(next, Utc::now() + ChronoDuration::days(30)));
    assert_eq!(renewed.end_date, Some(next));
    assert_eq!(renewed.usage_reset_at, Some(next));
}

#[tokio::test]
async fn yearly_renewal_leaves_usage_reset_alone() {
    let h = harness();
    let (_, subscription, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Yearly,
        TransactionType::Renewal,
        SubscriptionStatus::Active,
    )
    .await;

    let payload = fake_webhook(transaction.id, "MTX-RENEW-Y", "completed", 990_000);
    h.orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();

    let renewed = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();
    let next = renewed.next_billing_date.expect("next billing date");
    assert!(within(next, Utc::now() + ChronoDuration::days(365)));
    assert_eq!(renewed.usage_reset_at, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_run_effects_once() {
    let h = harness();
    let (_, subscription, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;
    let payload = fake_webhook(transaction.id, "MTX-RACE", "completed", 990_000);

    let deliveries = (0..8).map(|_| {
        let orchestrator = h.orchestrator.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            orchestrator
                .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
                .await
        })
    });
    let outcomes: Vec<WebhookOutcome> = join_all(deliveries)
        .await
        .into_iter()
        .map(|joined| joined.expect("join").expect("webhook"))
        .collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, WebhookOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1, "outcomes: {:?}", outcomes);
    assert!(outcomes.iter().all(WebhookOutcome::acknowledged));

    assert_eq!(h.repo.invoices().await.len(), 1);
    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Completed);
    assert!(stored.invoice_id.is_some());
    let activated = h.repo.get_subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(activated.status, SubscriptionStatus::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invoices_get_contiguous_numbers() {
    let h = harness_with(OrchestratorConfig {
        invoice_max_attempts: 20,
        ..OrchestratorConfig::default()
    });
    let mut transactions = Vec::new();
    for i in 0..6 {
        transactions.push(seed_processing(&h.repo, &format!("MTX-SEQ-{}", i)).await);
    }

    let deliveries = transactions.iter().enumerate().map(|(i, tx)| {
        let orchestrator = h.orchestrator.clone();
        let payload = fake_webhook(tx.id, &format!("MTX-SEQ-{}", i), "completed", 150_000);
        tokio::spawn(async move {
            orchestrator
                .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
                .await
        })
    });
    for joined in join_all(deliveries).await {
        assert!(matches!(
            joined.expect("join").expect("webhook"),
            WebhookOutcome::Applied { .. }
        ));
    }

    let prefix = month_prefix(Utc::now());
    let numbers: Vec<String> = h
        .repo
        .invoices()
        .await
        .into_iter()
        .map(|invoice| invoice.invoice_number)
        .collect();
    let expected: Vec<String> = (1..=6).map(|n| format!("{}{:04}", prefix, n)).collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn tampered_signature_changes_nothing() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-TAMPER").await;
    let payload = fake_webhook(transaction.id, "MTX-TAMPER", "completed", 150_000);

    let outcome = h
        .orchestrator
        .process_webhook("midtrans", &payload, "forged")
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::InvalidSignature);
    assert!(!outcome.acknowledged());

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Processing);
    assert_eq!(stored.updated_at, transaction.updated_at);
    assert!(h.repo.invoices().await.is_empty());
}

#[tokio::test]
async fn unknown_provider_status_is_ignored() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-ODD").await;
    let payload = fake_webhook(transaction.id, "MTX-ODD", "partially_settled_v2", 150_000);

    let outcome = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            transaction_id: transaction.id
        }
    );

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Processing);
    assert!(h.repo.invoices().await.is_empty());
}

#[tokio::test]
async fn late_failure_after_completion_is_rejected() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-LATE").await;
    let completed = fake_webhook(transaction.id, "MTX-LATE", "completed", 150_000);
    h.orchestrator
        .process_webhook("midtrans", &completed, FAKE_SIGNATURE)
        .await
        .unwrap();

    let failed = fake_webhook(transaction.id, "MTX-LATE", "failed", 150_000);
    let outcome = h
        .orchestrator
        .process_webhook("midtrans", &failed, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Rejected {
            from: PaymentState::Completed,
            to: PaymentState::Failed
        }
    );
    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Completed);
}

#[tokio::test]
async fn orphan_and_unknown_provider_webhooks() {
    let h = harness();
    let payload = fake_webhook(Uuid::new_v4(), "MTX-NOBODY", "completed", 1_000);

    let orphan = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(orphan, WebhookOutcome::Orphan);

    let unknown = h
        .orchestrator
        .process_webhook("stripe", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        unknown,
        WebhookOutcome::UnknownProvider {
            provider: "stripe".to_string()
        }
    );
}

#[tokio::test]
async fn completed_signal_retries_missing_invoice() {
    let h = harness();
    let mut transaction = seed_processing(&h.repo, "MTX-NOINV").await;
    transaction.status = PaymentState::Completed;
    transaction.paid_at = Some(Utc::now());
    h.repo.insert_transaction(transaction.clone()).await;

    let payload = fake_webhook(transaction.id, "MTX-NOINV", "completed", 150_000);
    let outcome = h
        .orchestrator
        .process_webhook("midtrans", &payload, FAKE_SIGNATURE)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Duplicate {
            transaction_id: transaction.id
        }
    );

    let invoices = h.repo.invoices().await;
    assert_eq!(invoices.len(), 1);
    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.invoice_id, Some(invoices[0].id));
}

#[tokio::test]
async fn gateway_failure_leaves_transaction_pending() {
    let h = harness();
    let (_, _, transaction) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;

    h.provider.fail_calls(true);
    let err = h
        .orchestrator
        .create_payment_for_transaction(transaction.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::GatewayError { .. }));

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Pending);
    assert!(stored.external_id.is_none());

    h.provider.fail_calls(false);
    h.orchestrator
        .create_payment_for_transaction(transaction.id, None)
        .await
        .expect("retry succeeds");
    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Processing);
}

#[tokio::test(start_paused = true)]
async fn slow_gateway_times_out() {
    let h = harness_with(OrchestratorConfig {
        adapter_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    });
    let transaction = seed_processing(&h.repo, "MTX-SLOW").await;
    h.provider.set_status(PaymentState::Completed);
    h.provider.set_delay(Some(Duration::from_secs(5)));

    let err = h
        .orchestrator
        .check_payment_status(transaction.id)
        .await
        .unwrap_err();
    match err {
        OrchestratorError::GatewayError { message, .. } => {
            assert!(message.contains("timed out"), "message: {}", message)
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let stored = h.repo.get_transaction(transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentState::Processing);
}

#[tokio::test]
async fn status_poll_applies_provider_answer() {
    let h = harness();
    let transaction = seed_processing(&h.repo, "MTX-POLL").await;

    let unchanged = h.orchestrator.check_payment_status(transaction.id).await.unwrap();
    assert_eq!(unchanged.status, PaymentState::Processing);

    h.provider.set_status(PaymentState::Completed);
    let completed = h.orchestrator.check_payment_status(transaction.id).await.unwrap();
    assert_eq!(completed.status, PaymentState::Completed);
    assert_eq!(h.repo.invoices().await.len(), 1);
}

#[tokio::test]
async fn cancel_needs_a_started_payment() {
    let h = harness();
    let (_, _, pending) = seed_subscription_payment(
        &h.repo,
        BillingCycle::Monthly,
        TransactionType::Subscription,
        SubscriptionStatus::Inactive,
    )
    .await;
    let err = h.orchestrator.cancel_payment(pending.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::MissingExternalId { .. }));

    let processing = seed_processing(&h.repo, "MTX-CANCEL").await;
    let cancelled = h.orchestrator.cancel_payment(processing.id).await.unwrap();
    assert_eq!(cancelled.status, PaymentState::Cancelled);
    assert!(h.repo.invoices().await.is_empty());
}
