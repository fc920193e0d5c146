/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! # mail-seal
//!
//! Mail authentication middleware for milter-driven MTAs. A per-message
//! [`session::Session`] consumes the milter event stream, verifies inbound
//! DKIM signatures and ARC chains while the message is still being received,
//! and emits the header insertions for a new DKIM signature and/or ARC set
//! (ARC-Authentication-Results, ARC-Message-Signature, ARC-Seal) when the
//! administrative boundary is crossed.
//!
//! The building blocks are usable on their own:
//!
//! - [`common::canonical`] implements the `simple` and `relaxed`
//!   canonicalization algorithms of RFC 6376, streaming for bodies.
//! - [`common::bodyhash`] multiplexes one body stream into every
//!   (canonicalization, hash, length-limit) digest the message needs.
//! - [`dkim`] and [`arc`] parse, serialize, sign and verify the four
//!   signature header kinds of RFC 6376 and RFC 8617.
//! - [`common::resolver`] fetches and caches `_domainkey` TXT records.

use std::fmt::Display;
use std::sync::Arc;

pub mod arc;
pub mod common;
pub mod config;
pub mod dkim;
pub mod dmarc;
pub mod session;

use common::bodyhash::BodyHashKey;
use common::headers::parse_header_field;
use common::resolver::DomainKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ParseError(String),
    MissingParameters,
    NoHeadersFound,
    CryptoError(String),
    Io(String),
    Base64,
    UnsupportedVersion,
    UnsupportedAlgorithm,
    UnsupportedCanonicalization,
    UnsupportedKeyType,
    FailedVerification,
    InvalidAddress,
    ArcInvalidInstance(u32),
    ArcInvalidCv,
    ArcBrokenChain,
    DnsError(String),
    DnsRecordNotFound,
    InvalidRecordType,
    Config(String),
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ParseError(details) => write!(f, "Parse error: {}", details),
            Error::MissingParameters => write!(f, "Missing parameters"),
            Error::NoHeadersFound => write!(f, "No headers found"),
            Error::CryptoError(err) => write!(f, "Cryptography layer error: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Base64 => write!(f, "Base64 encode or decode error."),
            Error::UnsupportedVersion => write!(f, "Unsupported version in signature header."),
            Error::UnsupportedAlgorithm => write!(f, "Unsupported algorithm in signature header."),
            Error::UnsupportedCanonicalization => {
                write!(f, "Unsupported canonicalization method in signature header.")
            }
            Error::UnsupportedKeyType => {
                write!(f, "Unsupported key type in DKIM DNS record.")
            }
            Error::FailedVerification => write!(f, "Signature verification failed."),
            Error::InvalidAddress => write!(f, "Invalid email address format."),
            Error::ArcInvalidInstance(i) => {
                write!(f, "Invalid 'i={}' value found in ARC header.", i)
            }
            Error::ArcInvalidCv => write!(f, "Invalid 'cv=' value found in ARC-Seal."),
            Error::ArcBrokenChain => write!(f, "Broken or missing ARC chain."),
            Error::DnsError(err) => write!(f, "DNS resolution error: {}", err),
            Error::DnsRecordNotFound => write!(f, "DNS record not found."),
            Error::InvalidRecordType => write!(f, "Invalid record."),
            Error::Config(err) => write!(f, "Configuration error: {}", err),
            Error::Protocol(err) => write!(f, "Protocol error: {}", err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<rsa::errors::Error> for Error {
    fn from(err: rsa::errors::Error) -> Self {
        Error::CryptoError(err.to_string())
    }
}

impl From<ed25519_dalek::ed25519::Error> for Error {
    fn from(err: ed25519_dalek::ed25519::Error) -> Self {
        Error::CryptoError(err.to_string())
    }
}

/// Outcome of verifying one signature header, in Authentication-Results
/// vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    None,
    Neutral,
    Pass,
    Fail,
    Policy,
    TempError,
    PermError,
}

impl Display for VerifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VerifyStatus::None => "none",
            VerifyStatus::Neutral => "neutral",
            VerifyStatus::Pass => "pass",
            VerifyStatus::Fail => "fail",
            VerifyStatus::Policy => "policy",
            VerifyStatus::TempError => "temperror",
            VerifyStatus::PermError => "permerror",
        })
    }
}

/// Verification verdict recorded on a signature record.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    status: VerifyStatus,
    message: String,
    domain_key: Option<Arc<DomainKey>>,
}

impl VerifyResult {
    pub(crate) fn new(status: VerifyStatus, message: impl Into<String>) -> Self {
        VerifyResult {
            status,
            message: message.into(),
            domain_key: None,
        }
    }

    pub(crate) fn with_domain_key(mut self, domain_key: Option<Arc<DomainKey>>) -> Self {
        self.domain_key = domain_key;
        self
    }

    pub fn status(&self) -> VerifyStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn domain_key(&self) -> Option<&DomainKey> {
        self.domain_key.as_deref()
    }
}

/// The parsed authentication state of one message: every DKIM-Signature in
/// arrival order plus the instance-indexed ARC chain.
#[derive(Debug, Default)]
pub struct AuthenticationHeaders {
    pub dkim_signatures: Vec<dkim::Signature>,
    pub arc_chain: arc::ArcChain,
}

impl AuthenticationHeaders {
    /// Builds both indices from the raw header buffer. Unparseable
    /// DKIM-Signature records are dropped; a structurally broken ARC set
    /// marks the whole chain as failed.
    pub fn parse(headers: &[String]) -> Self {
        let mut dkim_signatures = Vec::new();
        for header in headers {
            let (name, _) = parse_header_field(header);
            if name.eq_ignore_ascii_case("dkim-signature") {
                match dkim::Signature::parse(header) {
                    Ok(signature) => dkim_signatures.push(signature),
                    Err(err) => {
                        log::debug!("dropping unparseable DKIM-Signature: {}", err);
                    }
                }
            }
        }

        AuthenticationHeaders {
            dkim_signatures,
            arc_chain: arc::ArcChain::parse(headers),
        }
    }

    /// Every body-hash key committed to by an inbound signature. The
    /// MultiHash is seeded from this set before the first body byte arrives.
    pub fn body_hash_keys(&self) -> Vec<BodyHashKey> {
        let mut keys: Vec<BodyHashKey> = Vec::new();

        for signature in &self.dkim_signatures {
            let key = BodyHashKey {
                canonicalization: signature.cb,
                algorithm: signature.a.hash_algorithm(),
                limit: signature.l,
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        for set in self.arc_chain.sets() {
            if let Some(ams) = &set.message_signature {
                let key = BodyHashKey {
                    canonicalization: ams.cb,
                    algorithm: ams.a.hash_algorithm(),
                    limit: 0,
                };
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        keys
    }
}
