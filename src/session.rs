/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Per-message milter session. One [`Session`] consumes the semantic events
//! of one filter conversation in causal order and, at end-of-message, emits
//! the header insertions for the configured DKIM signature and ARC set.
//!
//! The session is single-writer: the caller delivers all events for one
//! message from one logical task, so no internal locking is needed.

use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;

use crate::arc::{AuthenticationResults, ChainValidation, MessageSignature, Seal, MAX_INSTANCE};
use crate::common::bodyhash::{BodyHashKey, MultiBodyHash};
use crate::common::canonical::Canonicalization;
use crate::common::crypto::HashAlgorithm;
use crate::common::headers::{extract_headers_arc, extract_headers_dkim, normalize_to_crlf,
    parse_address_domain};
use crate::common::resolver::Resolver;
use crate::config::Config;
use crate::dkim;
use crate::{AuthenticationHeaders, Error, Result, VerifyStatus};

/// Verdict of the external SPF check, embedded verbatim into the
/// ARC-Authentication-Results value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl Display for SpfResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        })
    }
}

/// SPF is evaluated outside the core; implementations plug in here.
pub trait SpfCheck: Send + Sync {
    fn check(&self, remote_addr: IpAddr, mail_from: &str, helo: &str) -> SpfResult;
}

/// Placeholder checker for deployments without SPF evaluation.
#[derive(Debug, Default)]
pub struct NoSpfCheck;

impl SpfCheck for NoSpfCheck {
    fn check(&self, _remote_addr: IpAddr, _mail_from: &str, _helo: &str) -> SpfResult {
        SpfResult::None
    }
}

/// An insert-header action for the MTA. Actions submitted at the same index
/// are applied in reverse submission order, so the last submitted header
/// ends up on top of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertHeader {
    pub index: u32,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    Connected,
    Greeted,
    Envelope,
    Recipient,
    Headers,
    Body,
    Done,
}

/// State machine for one filter conversation.
pub struct Session {
    config: Arc<Config>,
    spf: Arc<dyn SpfCheck>,
    stage: Stage,
    remote_addr: Option<IpAddr>,
    helo: String,
    mail_from: String,
    authenticated_user: String,
    rcpt_to_domain: String,
    from: String,
    from_domain: String,
    sign_dkim: bool,
    sign_arc: bool,
    headers: Vec<String>,
    body_hashes: MultiBodyHash,
    auth_headers: Option<AuthenticationHeaders>,
}

impl Session {
    pub fn new(config: Arc<Config>, spf: Arc<dyn SpfCheck>) -> Self {
        Session {
            config,
            spf,
            stage: Stage::Init,
            remote_addr: None,
            helo: String::new(),
            mail_from: String::new(),
            authenticated_user: String::new(),
            rcpt_to_domain: String::new(),
            from: String::new(),
            from_domain: String::new(),
            sign_dkim: false,
            sign_arc: false,
            headers: Vec::new(),
            body_hashes: MultiBodyHash::new(),
            auth_headers: None,
        }
    }

    fn advance(&mut self, from: &[Stage], to: Stage) -> Result<()> {
        if !from.contains(&self.stage) {
            return Err(Error::Protocol(format!(
                "unexpected event in stage {:?}",
                self.stage
            )));
        }
        self.stage = to;
        Ok(())
    }

    /// The parsed authentication headers with their verification verdicts,
    /// available after end-of-message.
    pub fn authentication_headers(&self) -> Option<&AuthenticationHeaders> {
        self.auth_headers.as_ref()
    }

    pub fn connect(&mut self, remote_addr: IpAddr) -> Result<()> {
        self.advance(&[Stage::Init], Stage::Connected)?;
        self.remote_addr = Some(remote_addr);
        log::debug!("connect: {}", remote_addr);
        Ok(())
    }

    pub fn helo(&mut self, name: &str) -> Result<()> {
        self.advance(&[Stage::Connected, Stage::Greeted], Stage::Greeted)?;
        self.helo = name.to_string();
        log::debug!("helo: {}", name);
        Ok(())
    }

    /// The `authenticated-user` macro is read at MAIL time when the MTA
    /// supplies it.
    pub fn mail_from(&mut self, sender: &str, authenticated_user: Option<&str>) -> Result<()> {
        self.advance(&[Stage::Greeted], Stage::Envelope)?;
        self.mail_from = sender.to_string();
        self.authenticated_user = authenticated_user.unwrap_or_default().to_string();
        log::debug!("mail from: {}", sender);
        Ok(())
    }

    /// Decides the ARC signing policy. Authenticated submissions and
    /// connections from MyNetworks are never sealed; only the last recipient
    /// decision is retained.
    pub fn rcpt_to(&mut self, recipient: &str) -> Result<()> {
        self.advance(&[Stage::Envelope, Stage::Recipient], Stage::Recipient)?;
        log::debug!("rcpt to: {}", recipient);

        if !self.authenticated_user.is_empty()
            || self
                .remote_addr
                .is_some_and(|addr| self.config.is_my_network(addr))
        {
            return Ok(());
        }

        let domain = match parse_address_domain(recipient) {
            Ok(domain) => domain,
            Err(err) => {
                log::debug!("unusable recipient {}: {}", recipient, err);
                return Ok(());
            }
        };
        self.rcpt_to_domain = domain;

        if let Some(domain) = self.config.domain(&self.rcpt_to_domain) {
            self.sign_arc = true;
            self.body_hashes.add_body_hash(BodyHashKey::new(
                domain.body_canonicalization,
                domain.hash_algorithm,
                0,
            ));
        }
        Ok(())
    }

    /// Appends one header to the ordered buffer. Seeing `From` fixes the
    /// DKIM policy for the message.
    pub fn header(&mut self, name: &str, value: &str) -> Result<()> {
        self.advance(&[Stage::Recipient, Stage::Headers], Stage::Headers)?;

        let value = normalize_to_crlf(value);
        self.headers.push(format!("{}: {}\r\n", name, value));

        if name.eq_ignore_ascii_case("from") {
            self.from = value.clone();
            log::debug!("from: {}", self.from);
            match parse_address_domain(&value) {
                Ok(domain) => self.from_domain = domain,
                Err(err) => {
                    log::debug!("unusable From header: {}", err);
                    self.sign_dkim = false;
                    return Ok(());
                }
            }
            if let Some(domain) = self.config.domain(&self.from_domain) {
                self.sign_dkim = true;
                self.body_hashes.add_body_hash(BodyHashKey::new(
                    domain.body_canonicalization,
                    domain.hash_algorithm,
                    0,
                ));
            }
        }
        Ok(())
    }

    /// Parses the inbound signature headers and finishes seeding the body
    /// hash set, so every hasher exists before the first body byte.
    pub fn end_of_headers(&mut self) -> Result<()> {
        self.advance(&[Stage::Recipient, Stage::Headers], Stage::Body)?;

        let auth = AuthenticationHeaders::parse(&self.headers);
        for key in auth.body_hash_keys() {
            self.body_hashes.add_body_hash(key);
        }
        self.auth_headers = Some(auth);
        Ok(())
    }

    pub fn body_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.advance(&[Stage::Body], Stage::Body)?;
        self.body_hashes.write(chunk);
        Ok(())
    }

    /// Finalizes the hashes, verifies the inbound signatures best-effort and
    /// runs the signing decisions. The returned actions are in submission
    /// order; signing failures are logged and never fail the message.
    pub async fn end_of_message(&mut self, resolver: &Resolver) -> Result<Vec<InsertHeader>> {
        self.advance(&[Stage::Body], Stage::Done)?;
        self.body_hashes.close();

        let mut auth = match self.auth_headers.take() {
            Some(auth) => auth,
            None => AuthenticationHeaders::parse(&self.headers),
        };

        // Inbound verification is informational; its verdicts feed the AAR.
        for signature in &mut auth.dkim_signatures {
            let key = BodyHashKey::new(signature.cb, signature.a.hash_algorithm(), signature.l);
            let body_hash = self.body_hashes.get(&key).unwrap_or_default().to_string();
            signature.verify(&self.headers, &body_hash, resolver).await;
        }
        let max = auth.arc_chain.max_instance();
        if max > 0 {
            let body_hash = auth
                .arc_chain
                .get_instance(max)
                .and_then(|set| set.message_signature.as_ref())
                .map(|ams| BodyHashKey::new(ams.cb, ams.a.hash_algorithm(), 0))
                .and_then(|key| self.body_hashes.get(&key))
                .unwrap_or_default()
                .to_string();
            auth.arc_chain.verify(&self.headers, &body_hash, resolver).await;
        }

        let mut actions = Vec::new();
        if let Err(err) = self.dkim_sign(&mut actions) {
            log::error!("dkim signing aborted: {}", err);
        }
        if let Err(err) = self.arc_sign(&auth, &mut actions) {
            log::error!("arc sealing aborted: {}", err);
        }
        self.auth_headers = Some(auth);
        Ok(actions)
    }

    /// Builds the DKIM-Signature for the sender domain, unless the message
    /// already carries one.
    fn dkim_sign(&mut self, actions: &mut Vec<InsertHeader>) -> Result<()> {
        if !self.sign_dkim {
            return Ok(());
        }
        if !extract_headers_dkim(&self.headers, &["DKIM-Signature"]).is_empty() {
            log::info!("DKIM-Signature found, skip signing");
            return Ok(());
        }
        let Some(domain) = self.config.domain(&self.from_domain) else {
            return Ok(());
        };
        if !domain.dkim {
            return Ok(());
        }

        let key = BodyHashKey::new(domain.body_canonicalization, domain.hash_algorithm, 0);
        let Some(body_hash) = self.body_hashes.get(&key) else {
            log::error!("dkim: body hash missing for {}", domain.domain);
            return Ok(());
        };

        let mut signature = dkim::Signature {
            v: 1,
            a: domain.private_key.algorithm(),
            bh: body_hash.to_string(),
            ch: domain.header_canonicalization,
            cb: domain.body_canonicalization,
            d: domain.domain.clone(),
            s: domain.selector.clone(),
            ..Default::default()
        };

        let signed = extract_headers_dkim(&self.headers, &self.config.dkim_sign_headers);
        signature.sign(&signed, &domain.private_key)?;

        let value = signature.to_string();
        actions.push(InsertHeader {
            index: 1,
            name: "DKIM-Signature".to_string(),
            value: value.clone(),
        });
        // Appended so the ARC set covers the fresh signature.
        self.headers.push(format!("DKIM-Signature: {}\r\n", value));
        Ok(())
    }

    /// Builds the next ARC set for the recipient domain. An inbound chain
    /// that already failed is never extended; either the full triple is
    /// emitted or nothing.
    fn arc_sign(
        &mut self,
        auth: &AuthenticationHeaders,
        actions: &mut Vec<InsertHeader>,
    ) -> Result<()> {
        if !self.sign_arc {
            return Ok(());
        }
        let Some(domain) = self.config.domain(&self.rcpt_to_domain) else {
            return Ok(());
        };
        if !domain.arc {
            return Ok(());
        }

        if auth.arc_chain.chain_validation() == ChainValidation::Fail {
            return Err(Error::ArcBrokenChain);
        }
        let instance = auth.arc_chain.max_instance() + 1;
        if instance > MAX_INSTANCE {
            return Err(Error::ArcInvalidInstance(instance));
        }

        // The AMS body hash is fixed to relaxed/sha256; the body pipeline
        // never runs twice.
        let key = BodyHashKey::new(Canonicalization::Relaxed, HashAlgorithm::Sha256, 0);
        let Some(body_hash) = self.body_hashes.get(&key) else {
            log::error!("arc: relaxed/sha256 body hash missing for {}", domain.domain);
            return Ok(());
        };

        let mut message_signature = MessageSignature {
            i: instance,
            a: domain.private_key.algorithm(),
            bh: body_hash.to_string(),
            ch: domain.header_canonicalization,
            cb: domain.body_canonicalization,
            d: self.rcpt_to_domain.clone(),
            s: domain.arc_selector.clone(),
            ..Default::default()
        };
        let signed = extract_headers_arc(&self.headers, &self.config.arc_sign_headers);
        message_signature.sign(&signed, &domain.private_key)?;

        let mut results = Vec::new();
        if let Some(remote_addr) = self.remote_addr {
            let spf = self.spf.check(remote_addr, &self.mail_from, &self.helo);
            results.push(format!(
                "spf={} smtp.mailfrom={} smtp.helo={}",
                spf, self.mail_from, self.helo
            ));
        }
        for signature in &auth.dkim_signatures {
            results.push(signature.result_string());
        }
        results.push(auth.arc_chain.verify_result_string());

        let authentication_results = AuthenticationResults {
            i: instance,
            authserv_id: self.rcpt_to_domain.clone(),
            results,
            ..Default::default()
        };

        let cv = match auth.arc_chain.verify_result() {
            VerifyStatus::None => ChainValidation::None,
            VerifyStatus::Pass => ChainValidation::Pass,
            _ => ChainValidation::Fail,
        };
        let mut seal = Seal {
            i: instance,
            a: domain.private_key.algorithm(),
            cv: Some(cv),
            d: self.rcpt_to_domain.clone(),
            s: domain.arc_selector.clone(),
            ..Default::default()
        };

        let mut chain = auth.arc_chain.arc_headers();
        chain.push(format!(
            "ARC-Authentication-Results: {}",
            authentication_results
        ));
        chain.push(format!("ARC-Message-Signature: {}", message_signature));
        seal.sign(&chain, &domain.private_key)?;

        for (name, value) in [
            ("ARC-Authentication-Results", authentication_results.to_string()),
            ("ARC-Message-Signature", message_signature.to_string()),
            ("ARC-Seal", seal.to_string()),
        ] {
            actions.push(InsertHeader {
                index: 1,
                name: name.to_string(),
                value,
            });
        }
        Ok(())
    }
}
