//! Services module for billing logic

pub mod billing_effects;
pub mod invoice_numbering;
pub mod payment_orchestrator;

pub use billing_effects::BillingEffects;
pub use invoice_numbering::InvoiceNumbering;
pub use payment_orchestrator::{
    OrchestratorConfig, OrchestratorError, OrchestratorResult, PaymentOrchestrator,
    TransitionOutcome, WebhookOutcome,
};
