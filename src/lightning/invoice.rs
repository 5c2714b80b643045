use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::{Hash as _, sha256};
use lightning_invoice::Bolt11Invoice;

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<sha256::Hash> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(sha256::Hash::from_byte_array(
        invoice.payment_hash().to_byte_array(),
    ))
}

pub fn amount_msat_from_bolt11(invoice: &str) -> Result<Option<u64>> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(invoice.amount_milli_satoshis())
}
