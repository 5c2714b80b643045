//! Loop-out service coordinating a Lightning hold invoice with an
//! on-chain Bitcoin HTLC. The remote party pays a hold invoice whose
//! payment hash matches an on-chain hash-time-locked output; once the
//! payment is accepted the service funds the HTLC, and once the remote
//! party claims it on-chain the revealed preimage settles the invoice.

pub mod chain;
pub mod htlc;
pub mod lightning;
pub mod logging;
pub mod swap;
pub mod wallet;

pub mod proto {
    pub mod lnrpc {
        tonic::include_proto!("lnrpc");
    }

    pub mod invoicesrpc {
        tonic::include_proto!("invoicesrpc");
    }
}
