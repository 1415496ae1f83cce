//! Invoice numbering
//!
//! Numbers look like `INV/YYYYMM/NNNN`: one sequence per calendar month,
//! starting at 1, never reused. The unique index on `invoice_number` is the
//! only serialization point; concurrent writers that pick the same number
//! re-read and try again.

use crate::database::error::DatabaseError;
use crate::database::models::{Invoice, NewInvoice};
use crate::database::repository::BillingRepository;
use crate::services::payment_orchestrator::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const INVOICE_PREFIX: &str = "INV";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// `INV/YYYYMM/` for the month containing `now`.
pub fn month_prefix(now: DateTime<Utc>) -> String {
    format!("{}/{:04}{:02}/", INVOICE_PREFIX, now.year(), now.month())
}

pub fn format_invoice_number(year: i32, month: u32, sequence: u32) -> String {
    format!("{}/{:04}{:02}/{:04}", INVOICE_PREFIX, year, month, sequence)
}

/// Sequence from the third `/` segment, `None` for anything that doesn't look like ours.
pub fn parse_sequence(invoice_number: &str) -> Option<u32> {
    let mut segments = invoice_number.split('/');
    if segments.next()? != INVOICE_PREFIX {
        return None;
    }
    segments.next()?;
    let sequence = segments.next()?;
    if segments.next().is_some() || sequence.is_empty() {
        return None;
    }
    sequence.parse().ok()
}

#[derive(Clone)]
pub struct InvoiceNumbering {
    repository: Arc<dyn BillingRepository>,
    max_attempts: u32,
}

impl InvoiceNumbering {
    pub fn new(repository: Arc<dyn BillingRepository>, max_attempts: u32) -> Self {
        Self {
            repository,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn next_invoice_number(&self, now: DateTime<Utc>) -> OrchestratorResult<String> {
        let prefix = month_prefix(now);
        let latest = self
            .repository
            .find_latest_invoice_number(&prefix)
            .await
            .map_err(OrchestratorError::Repository)?;

        let next = match latest.as_deref().and_then(parse_sequence) {
            Some(sequence) => sequence + 1,
            None => 1,
        };
        Ok(format_invoice_number(now.year(), now.month(), next))
    }

    /// Assigns the next number and inserts, retrying number collisions.
    ///
    /// A collision on the transaction itself (it already has an invoice) is
    /// returned as-is so the caller can treat it as done.
    pub async fn create_invoice(
        &self,
        mut invoice: NewInvoice,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Invoice> {
        for attempt in 1..=self.max_attempts {
            invoice.invoice_number = self.next_invoice_number(now).await?;

            match self.repository.create_invoice(invoice.clone()).await {
                Ok(created) => {
                    info!(
                        invoice_number = %created.invoice_number,
                        transaction_id = %created.transaction_id,
                        attempt,
                        "invoice created"
                    );
                    return Ok(created);
                }
                Err(err) if is_number_collision(&err) => {
                    warn!(
                        invoice_number = %invoice.invoice_number,
                        attempt,
                        max_attempts = self.max_attempts,
                        "invoice number taken, retrying"
                    );
                }
                Err(err) => {
                    debug!(error = %err, "invoice insert failed");
                    return Err(OrchestratorError::Repository(err));
                }
            }
        }

        Err(OrchestratorError::SequenceConflict {
            prefix: month_prefix(now),
            attempts: self.max_attempts,
        })
    }
}

fn is_number_collision(err: &DatabaseError) -> bool {
    match err.violated_constraint() {
        Some(constraint) => !constraint.contains("transaction_id"),
        None => false,
    }
}
