use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::Amount;
use bitcoin::hashes::{Hash as _, sha256};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::{Request, Status};

use crate::proto::invoicesrpc::invoices_client::InvoicesClient;
use crate::proto::invoicesrpc::{
    AddHoldInvoiceRequest, CancelInvoiceMsg, SettleInvoiceMsg, SubscribeSingleInvoiceRequest,
};
use crate::proto::lnrpc::invoice::InvoiceState;

use super::{InvoiceEvents, InvoiceService};

/// Attaches the admin macaroon to every request, hex-encoded in the
/// `macaroon` metadata entry as lnd expects.
#[derive(Clone)]
pub struct MacaroonInterceptor {
    macaroon: Option<MetadataValue<Ascii>>,
}

impl MacaroonInterceptor {
    fn from_path(path: Option<&Path>) -> Result<Self> {
        let macaroon = match path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("read macaroon {}", path.display()))?;
                let value = MetadataValue::try_from(hex::encode(bytes))
                    .context("encode macaroon metadata")?;
                Some(value)
            }
            None => None,
        };
        Ok(Self { macaroon })
    }
}

impl Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(macaroon) = &self.macaroon {
            request.metadata_mut().insert("macaroon", macaroon.clone());
        }
        Ok(request)
    }
}

type Client = InvoicesClient<InterceptedService<Channel, MacaroonInterceptor>>;

/// Hold-invoice collaborator backed by lnd's invoices gRPC service.
#[derive(Clone)]
pub struct LndInvoiceService {
    client: Client,
}

impl LndInvoiceService {
    pub async fn connect(
        endpoint: String,
        tls_cert: Option<&Path>,
        macaroon: Option<&Path>,
    ) -> Result<Self> {
        let mut builder =
            Channel::from_shared(endpoint.clone()).context("parse lnd endpoint")?;

        if let Some(cert_path) = tls_cert {
            let pem = std::fs::read(cert_path)
                .with_context(|| format!("read tls cert {}", cert_path.display()))?;
            let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            builder = builder.tls_config(tls).context("configure lnd tls")?;
        }

        let channel = builder
            .connect()
            .await
            .with_context(|| format!("connect lnd {endpoint}"))?;
        let interceptor = MacaroonInterceptor::from_path(macaroon)?;

        Ok(Self {
            client: InvoicesClient::with_interceptor(channel, interceptor),
        })
    }

    /// Cancels an open or accepted hold invoice.
    pub async fn cancel_invoice(&self, hash: sha256::Hash) -> Result<()> {
        self.client
            .clone()
            .cancel_invoice(CancelInvoiceMsg {
                payment_hash: hash.to_byte_array().to_vec(),
            })
            .await
            .context("CancelInvoice")?;
        Ok(())
    }
}

#[async_trait]
impl InvoiceService for LndInvoiceService {
    async fn generate_hold_invoice(
        &self,
        hash: sha256::Hash,
        value: Amount,
        cltv_expiry: u32,
    ) -> Result<String> {
        let value = i64::try_from(value.to_sat()).context("invoice value out of range")?;
        let resp = self
            .client
            .clone()
            .add_hold_invoice(AddHoldInvoiceRequest {
                memo: "loop-out".to_string(),
                hash: hash.to_byte_array().to_vec(),
                value,
                expiry: 3600,
                cltv_expiry: cltv_expiry as u64,
            })
            .await
            .context("AddHoldInvoice")?
            .into_inner();
        Ok(resp.payment_request)
    }

    async fn watch_invoice(
        &self,
        hash: sha256::Hash,
        events: Arc<dyn InvoiceEvents>,
    ) -> Result<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = watch_loop(client, hash, events).await {
                tracing::warn!(%hash, error = %err, "invoice subscription failed");
            }
        });
        Ok(())
    }

    async fn settle_invoice(&self, preimage: &[u8]) -> Result<()> {
        self.client
            .clone()
            .settle_invoice(SettleInvoiceMsg {
                preimage: preimage.to_vec(),
            })
            .await
            .context("SettleInvoice")?;
        Ok(())
    }
}

async fn watch_loop(
    mut client: Client,
    hash: sha256::Hash,
    events: Arc<dyn InvoiceEvents>,
) -> Result<()> {
    let mut stream = client
        .subscribe_single_invoice(SubscribeSingleInvoiceRequest {
            r_hash: hash.to_byte_array().to_vec(),
        })
        .await
        .context("SubscribeSingleInvoice")?
        .into_inner();

    let mut accepted_fired = false;
    while let Some(invoice) = stream.message().await.context("invoice stream")? {
        tracing::debug!(%hash, state = ?invoice.state(), "invoice state change");
        match invoice.state() {
            InvoiceState::Accepted if !accepted_fired => {
                accepted_fired = true;
                events.invoice_accepted(hash).await;
            }
            InvoiceState::Settled => {
                events.invoice_settled(hash).await;
                break;
            }
            InvoiceState::Canceled => break,
            _ => {}
        }
    }

    Ok(())
}
