//! Bech32 account / node address helpers.
//!
//! A node address shares its 20-byte payload with the operator's account
//! address and differs only in the human-readable prefix
//! (`sent1…` ↔ `sentnode1…`).

use bech32::{self, FromBase32, ToBase32, Variant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid bech32 address '{addr}': {reason}")]
    Decode { addr: String, reason: String },

    #[error("address '{addr}' has prefix '{found}', expected '{expected}'")]
    Prefix {
        addr: String,
        found: String,
        expected: String,
    },

    #[error("failed to encode address: {0}")]
    Encode(String),
}

/// Decodes a bech32 address into `(prefix, payload)`.
pub fn decode(addr: &str) -> Result<(String, Vec<u8>), AddressError> {
    let (hrp, data, _variant) = bech32::decode(addr).map_err(|e| AddressError::Decode {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| AddressError::Decode {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    if bytes.is_empty() {
        return Err(AddressError::Decode {
            addr: addr.to_string(),
            reason: "empty payload".to_string(),
        });
    }
    Ok((hrp, bytes))
}

/// Encodes `payload` as a bech32 address with the given prefix.
pub fn encode(prefix: &str, payload: &[u8]) -> Result<String, AddressError> {
    bech32::encode(prefix, payload.to_base32(), Variant::Bech32)
        .map_err(|e| AddressError::Encode(e.to_string()))
}

/// Validates `addr` and, if `expected_prefix` is given, its prefix.
pub fn validate(addr: &str, expected_prefix: Option<&str>) -> Result<(), AddressError> {
    let (hrp, _) = decode(addr)?;
    if let Some(expected) = expected_prefix {
        if hrp != expected {
            return Err(AddressError::Prefix {
                addr: addr.to_string(),
                found: hrp,
                expected: expected.to_string(),
            });
        }
    }
    Ok(())
}

/// Re-encodes an account address under the node prefix.
pub fn node_address_from_account(account: &str, node_prefix: &str) -> Result<String, AddressError> {
    let (_, payload) = decode(account)?;
    encode(node_prefix, &payload)
}
