//! # Session Model
//!
//! A session is a metered grant of VPN access to one client. It links a
//! chain-assigned id to the backend peer (`peer_key`) serving it, and
//! tracks the usage counters that are enforced locally and reported on
//! chain.
//!
//! ## Numeric fields
//!
//! Byte counters and the byte quota are arbitrary-precision integers,
//! persisted as decimal strings so no precision is lost across the storage
//! boundary. The accessors parse on read; a persisted value that does not
//! parse means the ledger is corrupt, and the accessor panics rather than
//! guess.
//!
//! ## Duration
//!
//! `duration` is wall-clock time elapsed since `created_at`, in
//! nanoseconds. It is only ever written through [`Session::apply_usage`],
//! together with the byte counters, so the two cannot drift apart.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{self, AddressError};
use crate::chain::{ChainMsg, MsgUpdateSession};
use crate::peer::ServiceType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session id must be non-zero")]
    ZeroId,

    #[error("{field} must be non-empty")]
    Empty { field: &'static str },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("{field} '{value}' is not a non-negative integer")]
    Number { field: &'static str, value: String },

    #[error("{field} must be non-negative")]
    NegativeDuration { field: &'static str },

    #[error("signature is not valid base64: {0}")]
    Signature(String),
}

/// Persisted session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub account_address: String,
    pub node_address: String,
    pub download_bytes: String,
    pub upload_bytes: String,
    pub max_bytes: String,
    /// Nanoseconds.
    pub duration: i64,
    /// Nanoseconds.
    pub max_duration: i64,
    /// Base64.
    pub signature: String,
    pub peer_key: String,
    pub service_type: ServiceType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// New session with zero usage, created at `now`.
    pub fn new(
        id: u64,
        account_address: impl Into<String>,
        node_address: impl Into<String>,
        peer_key: impl Into<String>,
        service_type: ServiceType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            account_address: account_address.into(),
            node_address: node_address.into(),
            download_bytes: "0".to_string(),
            upload_bytes: "0".to_string(),
            max_bytes: "0".to_string(),
            duration: 0,
            max_duration: 0,
            signature: String::new(),
            peer_key: peer_key.into(),
            service_type,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: &BigUint) -> Self {
        self.max_bytes = max_bytes.to_str_radix(10);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = duration_to_nanos(max_duration);
        self
    }

    pub fn with_signature(mut self, signature: &[u8]) -> Self {
        self.signature = general_purpose::STANDARD.encode(signature);
        self
    }

    // ────────────────────────────────────────────────────────────────────
    // Accessors
    // ────────────────────────────────────────────────────────────────────

    pub fn download_bytes(&self) -> BigUint {
        parse_persisted("download_bytes", self.id, &self.download_bytes)
    }

    pub fn upload_bytes(&self) -> BigUint {
        parse_persisted("upload_bytes", self.id, &self.upload_bytes)
    }

    pub fn max_bytes(&self) -> BigUint {
        parse_persisted("max_bytes", self.id, &self.max_bytes)
    }

    /// Download plus upload.
    pub fn bytes(&self) -> BigUint {
        self.download_bytes() + self.upload_bytes()
    }

    pub fn duration(&self) -> Duration {
        nanos_to_duration(self.duration)
    }

    pub fn max_duration(&self) -> Duration {
        nanos_to_duration(self.max_duration)
    }

    pub fn signature(&self) -> Vec<u8> {
        match general_purpose::STANDARD.decode(&self.signature) {
            Ok(bytes) => bytes,
            Err(e) => panic!("session {}: persisted signature is not base64: {}", self.id, e),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Behaviour
    // ────────────────────────────────────────────────────────────────────

    /// True once either the byte or the duration quota is reached.
    pub fn is_quota_exceeded(&self) -> bool {
        self.bytes() >= self.max_bytes() || self.duration >= self.max_duration
    }

    /// Wall-clock time between creation and `now`, clamped at zero.
    pub fn elapsed_since_creation(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Writes new byte counters and recomputes `duration` as of `now`.
    ///
    /// Counters never move backwards: a lower value than the stored one
    /// (backend restart, stale report) keeps the stored value.
    pub fn apply_usage(
        &mut self,
        download_bytes: Option<&BigUint>,
        upload_bytes: Option<&BigUint>,
        now: DateTime<Utc>,
    ) {
        if download_bytes.is_none() && upload_bytes.is_none() {
            return;
        }
        if let Some(v) = download_bytes {
            if *v > self.download_bytes() {
                self.download_bytes = v.to_str_radix(10);
            }
        }
        if let Some(v) = upload_bytes {
            if *v > self.upload_bytes() {
                self.upload_bytes = v.to_str_radix(10);
            }
        }
        self.duration = duration_to_nanos(self.elapsed_since_creation(now));
        self.updated_at = now;
    }

    /// Usage report for this session.
    pub fn update_usage_msg(&self) -> ChainMsg {
        ChainMsg::UpdateSession(MsgUpdateSession {
            node_address: self.node_address.clone(),
            session_id: self.id,
            download_bytes: self.download_bytes().to_str_radix(10),
            upload_bytes: self.upload_bytes().to_str_radix(10),
            duration: self.duration,
            signature: self.signature.clone(),
        })
    }

    /// Checks a row before it is written.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.id == 0 {
            return Err(SessionError::ZeroId);
        }
        if self.peer_key.trim().is_empty() {
            return Err(SessionError::Empty { field: "peer_key" });
        }
        if self.account_address.is_empty() {
            return Err(SessionError::Empty { field: "account_address" });
        }
        if self.node_address.is_empty() {
            return Err(SessionError::Empty { field: "node_address" });
        }
        address::validate(&self.account_address, None)?;
        address::validate(&self.node_address, None)?;

        for (field, value) in [
            ("download_bytes", &self.download_bytes),
            ("upload_bytes", &self.upload_bytes),
            ("max_bytes", &self.max_bytes),
        ] {
            if parse_decimal(value).is_none() {
                return Err(SessionError::Number {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.duration < 0 {
            return Err(SessionError::NegativeDuration { field: "duration" });
        }
        if self.max_duration < 0 {
            return Err(SessionError::NegativeDuration { field: "max_duration" });
        }
        general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|e| SessionError::Signature(e.to_string()))?;
        Ok(())
    }
}

/// Parses a plain decimal string (digits only).
pub fn parse_decimal(s: &str) -> Option<BigUint> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigUint::parse_bytes(s.as_bytes(), 10)
}

fn parse_persisted(field: &str, id: u64, value: &str) -> BigUint {
    match parse_decimal(value) {
        Some(v) => v,
        None => panic!("session {}: persisted {} '{}' is not a decimal integer", id, field, value),
    }
}

pub(crate) fn duration_to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

pub(crate) fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time")
    }

    fn session() -> Session {
        let acc = address::encode("sent", &[7; 20]).expect("acc");
        let node = address::encode("sentnode", &[7; 20]).expect("node");
        Session::new(9, acc, node, "peer-9", ServiceType::WireGuard, t0())
            .with_max_bytes(&BigUint::from(1_000_000_000u64))
            .with_max_duration(Duration::from_secs(3600))
            .with_signature(b"client-signature")
    }

    #[test]
    fn byte_quota_triggers_at_equality() {
        let mut s = session();
        s.apply_usage(
            Some(&BigUint::from(600_000_000u64)),
            Some(&BigUint::from(399_999_999u64)),
            t0(),
        );
        assert!(!s.is_quota_exceeded());

        s.apply_usage(None, Some(&BigUint::from(400_000_000u64)), t0());
        assert_eq!(s.bytes(), BigUint::from(1_000_000_000u64));
        assert!(s.is_quota_exceeded());
    }

    #[test]
    fn duration_quota_triggers_at_equality() {
        let mut s = session();
        s.apply_usage(Some(&BigUint::from(1u8)), None, t0() + chrono::Duration::seconds(3599));
        assert!(!s.is_quota_exceeded());

        s.apply_usage(Some(&BigUint::from(1u8)), None, t0() + chrono::Duration::seconds(3600));
        assert_eq!(s.duration(), Duration::from_secs(3600));
        assert!(s.is_quota_exceeded());
    }

    #[test]
    fn counters_are_monotonic() {
        let mut s = session();
        s.apply_usage(Some(&BigUint::from(500u32)), Some(&BigUint::from(70u32)), t0());
        s.apply_usage(Some(&BigUint::from(100u32)), Some(&BigUint::from(80u32)), t0());
        assert_eq!(s.download_bytes(), BigUint::from(500u32));
        assert_eq!(s.upload_bytes(), BigUint::from(80u32));
    }

    #[test]
    fn values_beyond_u64_survive() {
        let huge = BigUint::parse_bytes(b"340282366920938463463374607431768211457", 10).expect("big");
        let mut s = session().with_max_bytes(&huge);
        s.apply_usage(Some(&huge), None, t0());
        assert_eq!(s.download_bytes(), huge);
        assert_eq!(s.max_bytes(), huge);
        assert_eq!(s.max_bytes, "340282366920938463463374607431768211457");
    }

    #[test]
    fn usage_msg_carries_counters_and_signature() {
        let mut s = session();
        s.apply_usage(Some(&BigUint::from(10u8)), Some(&BigUint::from(20u8)), t0() + chrono::Duration::seconds(5));
        match s.update_usage_msg() {
            ChainMsg::UpdateSession(m) => {
                assert_eq!(m.session_id, 9);
                assert_eq!(m.download_bytes, "10");
                assert_eq!(m.upload_bytes, "20");
                assert_eq!(m.duration, 5_000_000_000);
                assert_eq!(general_purpose::STANDARD.decode(&m.signature).expect("b64"), b"client-signature");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_bad_rows() {
        assert!(session().validate().is_ok());

        let mut s = session();
        s.upload_bytes = "-1".into();
        assert!(matches!(s.validate(), Err(SessionError::Number { field: "upload_bytes", .. })));

        let mut s = session();
        s.account_address = "garbage".into();
        assert!(matches!(s.validate(), Err(SessionError::Address(_))));

        let mut s = session();
        s.signature = "***".into();
        assert!(matches!(s.validate(), Err(SessionError::Signature(_))));

        let mut s = session();
        s.id = 0;
        assert_eq!(s.validate(), Err(SessionError::ZeroId));
    }

    #[test]
    #[should_panic(expected = "not a decimal integer")]
    fn corrupt_counter_panics() {
        let mut s = session();
        s.download_bytes = "12abc".into();
        let _ = s.bytes();
    }
}
