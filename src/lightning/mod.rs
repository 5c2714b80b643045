pub mod invoice;
pub mod lnd;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Amount;
use bitcoin::hashes::sha256;

/// Callbacks fired as a watched invoice moves through its lifecycle.
/// Delivery is at-most-once per registered watch per hash.
#[async_trait]
pub trait InvoiceEvents: Send + Sync {
    /// The payer's HTLC is locked in; funds are held but not released.
    async fn invoice_accepted(&self, hash: sha256::Hash);

    /// The invoice was settled with its preimage; funds are released.
    async fn invoice_settled(&self, hash: sha256::Hash);
}

/// Boundary to the hold-invoice service.
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Creates a hold invoice for a payment hash chosen by the remote
    /// party and returns its BOLT11 payment request.
    async fn generate_hold_invoice(
        &self,
        hash: sha256::Hash,
        value: Amount,
        cltv_expiry: u32,
    ) -> Result<String>;

    /// Subscribes to state changes of the invoice with the given hash,
    /// delivering them to `events`.
    async fn watch_invoice(&self, hash: sha256::Hash, events: Arc<dyn InvoiceEvents>)
    -> Result<()>;

    /// Settles the accepted invoice identified by the preimage's hash.
    async fn settle_invoice(&self, preimage: &[u8]) -> Result<()>;
}
