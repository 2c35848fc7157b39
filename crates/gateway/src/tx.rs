//! Raw transaction decoding
//!
//! `eth_sendRawTransaction` payloads are decoded just far enough for
//! admission control: sender, recipient, value, and the leading 4-byte
//! method selector of the calldata. Nothing else of the ABI is parsed.

use crate::error::GatewayError;
use alloy_consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{hex, Address, Bytes, U256};

/// The admission-relevant fields of a decoded raw transaction
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    /// Recovered sender address
    pub from: Address,
    /// Recipient; `None` for contract deployments
    pub to: Option<Address>,
    /// Transferred value in wei
    pub value: U256,
    /// Calldata
    pub input: Bytes,
}

impl DecodedTransaction {
    /// Lowercase hex sender address
    pub fn from_hex(&self) -> String {
        format!("{:#x}", self.from)
    }

    /// Lowercase hex recipient address, if any
    pub fn to_hex(&self) -> Option<String> {
        self.to.map(|to| format!("{to:#x}"))
    }

    /// The 4-byte method selector of the calldata, if present
    pub fn selector(&self) -> Option<String> {
        if self.input.len() < 4 {
            return None;
        }
        Some(format!("0x{}", hex::encode(&self.input[..4])))
    }
}

/// Decoder seam for raw transaction payloads
///
/// The gateway only depends on this trait; tests substitute a canned
/// decoder to exercise the admission pipeline without crafting signed
/// payloads.
pub trait TxDecoder: Send + Sync {
    /// Decodes a `0x`-prefixed hex payload into its admission-relevant fields
    fn decode(&self, raw: &str) -> Result<DecodedTransaction, GatewayError>;
}

/// Production decoder backed by EIP-2718 envelope decoding
#[derive(Debug, Default)]
pub struct EnvelopeTxDecoder;

impl TxDecoder for EnvelopeTxDecoder {
    fn decode(&self, raw: &str) -> Result<DecodedTransaction, GatewayError> {
        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| GatewayError::TransactionInvalid(format!("malformed hex payload: {e}")))?;

        let tx = TxEnvelope::decode_2718(&mut bytes.as_slice())
            .map_err(|e| GatewayError::TransactionInvalid(format!("undecodable payload: {e}")))?;

        let from = tx
            .recover_signer()
            .map_err(|_| GatewayError::TransactionInvalid("sender cannot be recovered".into()))?;

        Ok(DecodedTransaction {
            from,
            to: tx.to(),
            value: tx.value(),
            input: tx.input().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_malformed_hex_rejected() {
        let err = EnvelopeTxDecoder.decode("0xzzzz").unwrap_err();
        assert!(matches!(err, GatewayError::TransactionInvalid(_)));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let err = EnvelopeTxDecoder.decode("0xdeadbeef").unwrap_err();
        assert!(matches!(err, GatewayError::TransactionInvalid(_)));
    }

    #[test]
    fn test_selector_extraction() {
        let tx = DecodedTransaction {
            from: address!("00000000000000000000000000000000000000aa"),
            to: Some(address!("00000000000000000000000000000000000000bb")),
            value: U256::ZERO,
            input: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb, 0x00, 0x01]),
        };
        assert_eq!(tx.selector().as_deref(), Some("0xa9059cbb"));
    }

    #[test]
    fn test_short_calldata_has_no_selector() {
        let tx = DecodedTransaction {
            from: address!("00000000000000000000000000000000000000aa"),
            to: None,
            value: U256::ZERO,
            input: Bytes::from(vec![0x01, 0x02]),
        };
        assert!(tx.selector().is_none());
    }

    #[test]
    fn test_hex_addresses_are_lowercase() {
        let tx = DecodedTransaction {
            from: address!("00000000000000000000000000000000000000AA"),
            to: Some(address!("00000000000000000000000000000000000000BB")),
            value: U256::ZERO,
            input: Bytes::new(),
        };
        assert_eq!(tx.from_hex(), "0x00000000000000000000000000000000000000aa");
        assert_eq!(tx.to_hex().as_deref(), Some("0x00000000000000000000000000000000000000bb"));
    }
}
