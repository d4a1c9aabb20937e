//! Payment identifiers and their encoding inside `tx.extra`
//!
//! A payment id is a 32-byte value shown to users as 64 hex characters. On
//! chain it travels inside a nonce record of the extra field, prefixed by the
//! `TX_EXTRA_NONCE_PAYMENT_ID` sub-tag.

use crate::error::{NodeError, Result};
use crate::extra::{self, ExtraNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

pub const PAYMENT_ID_SIZE: usize = 32;
pub const PAYMENT_ID_HEX_LEN: usize = PAYMENT_ID_SIZE * 2;

/// Sub-tag inside a nonce record announcing a payment id.
pub const TX_EXTRA_NONCE_PAYMENT_ID: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentId([u8; PAYMENT_ID_SIZE]);

impl PaymentId {
    pub fn from_bytes(bytes: [u8; PAYMENT_ID_SIZE]) -> Self {
        PaymentId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PAYMENT_ID_SIZE] {
        &self.0
    }

    /// Fresh random payment id from the OS generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PAYMENT_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        PaymentId(bytes)
    }

    /// Canonical uppercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl FromStr for PaymentId {
    type Err = NodeError;

    /// Accepts exactly 64 hex characters of either case.
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != PAYMENT_ID_HEX_LEN {
            return Err(NodeError::InvalidPaymentId(s.to_string()));
        }
        let mut bytes = [0u8; PAYMENT_ID_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| NodeError::InvalidPaymentId(s.to_string()))?;
        Ok(PaymentId(bytes))
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Nonce payload carrying `payment_id`: sub-tag followed by the 32 bytes.
pub fn payment_id_to_nonce(payment_id: &PaymentId) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(1 + PAYMENT_ID_SIZE);
    nonce.push(TX_EXTRA_NONCE_PAYMENT_ID);
    nonce.extend_from_slice(payment_id.as_bytes());
    nonce
}

/// Recover a payment id from a nonce payload. `None` when the nonce carries
/// something else.
pub fn payment_id_from_nonce(nonce: &[u8]) -> Option<PaymentId> {
    if nonce.len() != 1 + PAYMENT_ID_SIZE || nonce[0] != TX_EXTRA_NONCE_PAYMENT_ID {
        return None;
    }
    let mut bytes = [0u8; PAYMENT_ID_SIZE];
    bytes.copy_from_slice(&nonce[1..]);
    Some(PaymentId(bytes))
}

/// Turn user supplied payment id text into extra field bytes.
///
/// Empty input means "no payment id" and yields an empty buffer.
pub fn to_extra_bytes(payment_id: &str) -> Result<Vec<u8>> {
    if payment_id.is_empty() {
        return Ok(Vec::new());
    }

    let id: PaymentId = payment_id.parse()?;
    extra::encode_nonce(&payment_id_to_nonce(&id)).map_err(|e| {
        NodeError::EncodingError(format!(
            "Something went wrong with payment_id \"{}\": {}",
            payment_id, e
        ))
    })
}

/// Read the payment id out of a transaction's extra field.
///
/// Returns an empty string when the field has no nonce or the nonce holds no
/// payment id. A malformed field is an error.
pub fn from_extra_bytes(extra: &[u8]) -> Result<String> {
    let fields = extra::parse_extra(extra)?;

    let id = extra::find_field::<ExtraNonce>(&fields)
        .and_then(|nonce| payment_id_from_nonce(&nonce.nonce));

    Ok(id.map(|id| id.to_hex()).unwrap_or_default())
}
