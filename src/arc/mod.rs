/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::fmt::Display;

use crate::common::canonical::Canonicalization;
use crate::common::crypto::Algorithm;
use crate::common::headers::delete_signature;
use crate::common::resolver::Resolver;
use crate::dkim::verify::{lookup_error_result, now_unix};
use crate::{VerifyResult, VerifyStatus};

pub mod headers;
pub mod message;
pub mod parse;
pub mod seal;

/// Highest ARC instance accepted before a chain is considered hostile.
pub const MAX_INSTANCE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainValidation {
    None,
    Fail,
    Pass,
}

impl ChainValidation {
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value {
            "none" => Ok(ChainValidation::None),
            "fail" => Ok(ChainValidation::Fail),
            "pass" => Ok(ChainValidation::Pass),
            _ => Err(crate::Error::ArcInvalidCv),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainValidation::None => "none",
            ChainValidation::Fail => "fail",
            ChainValidation::Pass => "pass",
        }
    }
}

impl Display for ChainValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ARC-Seal header.
#[derive(Debug, Clone)]
pub struct Seal {
    pub i: u32,
    pub a: Algorithm,
    pub b: String,
    pub cv: Option<ChainValidation>,
    pub d: String,
    pub s: String,
    pub t: u64,
    pub(crate) raw: String,
}

impl Default for Seal {
    fn default() -> Self {
        Seal {
            i: 0,
            a: Algorithm::RsaSha256,
            b: String::new(),
            cv: None,
            d: String::new(),
            s: String::new(),
            t: 0,
            raw: String::new(),
        }
    }
}

/// An ARC-Message-Signature header.
#[derive(Debug, Clone)]
pub struct MessageSignature {
    pub i: u32,
    pub a: Algorithm,
    pub b: String,
    pub bh: String,
    pub ch: Canonicalization,
    pub cb: Canonicalization,
    pub d: String,
    pub h: String,
    pub s: String,
    pub t: u64,
    pub(crate) raw: String,
}

impl Default for MessageSignature {
    fn default() -> Self {
        MessageSignature {
            i: 0,
            a: Algorithm::RsaSha256,
            b: String::new(),
            bh: String::new(),
            ch: Canonicalization::Simple,
            cb: Canonicalization::Simple,
            d: String::new(),
            h: String::new(),
            s: String::new(),
            t: 0,
            raw: String::new(),
        }
    }
}

/// An ARC-Authentication-Results header; only the instance, the authserv-id
/// and the result clauses are modelled.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationResults {
    pub i: u32,
    pub authserv_id: String,
    pub results: Vec<String>,
    pub(crate) raw: String,
}

/// The three sibling headers of one ARC instance.
#[derive(Debug, Clone, Default)]
pub struct ArcSet {
    pub instance: u32,
    pub seal: Option<Seal>,
    pub message_signature: Option<MessageSignature>,
    pub results: Option<AuthenticationResults>,
    pub verify_result: Option<VerifyResult>,
}

impl ArcSet {
    fn is_complete(&self) -> bool {
        self.seal.is_some() && self.message_signature.is_some() && self.results.is_some()
    }
}

/// The instance-indexed ARC chain of one message. Instance linkage is by
/// number, so the model stays tree shaped.
#[derive(Debug, Clone, Default)]
pub struct ArcChain {
    sets: Vec<ArcSet>,
    malformed: bool,
}

impl ArcChain {
    pub fn sets(&self) -> &[ArcSet] {
        &self.sets
    }

    /// True when the inbound headers violated an ARC structural invariant;
    /// such a chain always validates as `fail`.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    pub fn get_instance(&self, instance: u32) -> Option<&ArcSet> {
        self.sets.iter().find(|set| set.instance == instance)
    }

    pub(crate) fn entry(&mut self, instance: u32) -> &mut ArcSet {
        if let Some(index) = self.sets.iter().position(|set| set.instance == instance) {
            &mut self.sets[index]
        } else {
            self.sets.push(ArcSet {
                instance,
                ..Default::default()
            });
            self.sets.last_mut().unwrap()
        }
    }

    pub fn max_instance(&self) -> u32 {
        self.sets.iter().map(|set| set.instance).max().unwrap_or(0)
    }

    /// Evaluates the `cv=` claims of the chain: instance 1 must claim `none`
    /// and every later instance `pass`, otherwise the chain fails. An empty
    /// chain is `none`.
    pub fn chain_validation(&self) -> ChainValidation {
        if self.malformed {
            return ChainValidation::Fail;
        }
        let max = self.max_instance();
        if max == 0 {
            return ChainValidation::None;
        }
        for instance in 1..=max {
            let cv = self
                .get_instance(instance)
                .and_then(|set| set.seal.as_ref())
                .and_then(|seal| seal.cv);
            let expected = if instance == 1 {
                ChainValidation::None
            } else {
                ChainValidation::Pass
            };
            if cv != Some(expected) {
                return ChainValidation::Fail;
            }
        }
        ChainValidation::Pass
    }

    /// All complete instances in Seal-signing order: for each instance the
    /// AAR, then the AMS, then the Seal.
    pub fn arc_headers(&self) -> Vec<String> {
        let mut headers = Vec::new();
        for instance in 1..=self.max_instance() {
            if let Some(set) = self.get_instance(instance) {
                if set.is_complete() {
                    headers.push(set.results.as_ref().unwrap().raw());
                    headers.push(set.message_signature.as_ref().unwrap().raw());
                    headers.push(set.seal.as_ref().unwrap().raw());
                }
            }
        }
        headers
    }

    /// The verdict of the highest instance, `none` for an empty chain.
    pub fn verify_result(&self) -> VerifyStatus {
        let max = self.max_instance();
        if max == 0 {
            return VerifyStatus::None;
        }
        self.get_instance(max)
            .and_then(|set| set.verify_result.as_ref())
            .map(|result| result.status())
            .unwrap_or(VerifyStatus::None)
    }

    /// The `arc=` clause for an Authentication-Results value.
    pub fn verify_result_string(&self) -> String {
        let max = self.max_instance();
        if max == 0 {
            return "arc=none".to_string();
        }
        match self.get_instance(max).and_then(|set| set.verify_result.as_ref()) {
            Some(result) => {
                format!("arc={} (i={} {})", result.status(), max, result.message())
            }
            None => "arc=none".to_string(),
        }
    }

    /// Verifies the newest instance: the AMS against the message and the
    /// Seal against the chain, with one key fetch for both. The verdict is
    /// recorded on that instance.
    pub async fn verify(&mut self, headers: &[String], body_hash: &str, resolver: &Resolver) {
        let max = self.max_instance();
        if max == 0 {
            return;
        }

        if self.malformed {
            self.entry(max).verify_result = Some(VerifyResult::new(
                VerifyStatus::Fail,
                "arc headers are malformed",
            ));
            return;
        }

        let (selector, domain) = {
            let set = self.get_instance(max).unwrap();
            match (&set.seal, &set.message_signature) {
                (Some(seal), Some(_)) => (seal.s.clone(), seal.d.clone()),
                _ => {
                    self.entry(max).verify_result =
                        Some(VerifyResult::new(VerifyStatus::Neutral, "arc is not found"));
                    return;
                }
            }
        };

        let domain_key = match resolver.lookup_arc_domain_key(&selector, &domain).await {
            Ok(domain_key) => domain_key,
            Err(err) => {
                self.entry(max).verify_result = Some(lookup_error_result(&err));
                return;
            }
        };

        let result = self.verify_instance_with_key(headers, body_hash, &domain_key, now_unix());
        self.entry(max).verify_result = Some(result.with_domain_key(Some(domain_key)));
    }

    pub(crate) fn verify_instance_with_key(
        &self,
        headers: &[String],
        body_hash: &str,
        domain_key: &crate::common::resolver::DomainKey,
        now: u64,
    ) -> VerifyResult {
        let max = self.max_instance();
        let set = self.get_instance(max).unwrap();
        let seal = set.seal.as_ref().unwrap();
        let ams = set.message_signature.as_ref().unwrap();

        // The Seal pre-image covers the prior instances in seal order, then
        // this instance's AAR and AMS.
        let mut seal_headers = Vec::new();
        for instance in 1..max {
            if let Some(prior) = self.get_instance(instance) {
                if prior.is_complete() {
                    seal_headers.push(prior.results.as_ref().unwrap().raw());
                    seal_headers.push(prior.message_signature.as_ref().unwrap().raw());
                    seal_headers.push(prior.seal.as_ref().unwrap().raw());
                }
            }
        }
        if let Some(results) = &set.results {
            seal_headers.push(results.raw());
        }
        seal_headers.push(ams.raw());

        let seal_result = seal.verify_with_key(&seal_headers, domain_key);
        let ams_result = ams.verify_with_key(headers, body_hash, domain_key, now);

        if seal_result.status() == VerifyStatus::Pass
            && ams_result.status() == VerifyStatus::Pass
        {
            VerifyResult::new(VerifyStatus::Pass, "good signature")
        } else if seal_result.status() != VerifyStatus::Pass {
            seal_result
        } else {
            ams_result
        }
    }
}

impl Seal {
    /// The raw header as received, or the serialized form for seals built
    /// locally.
    pub fn raw(&self) -> String {
        if self.raw.is_empty() {
            format!("ARC-Seal: {}", self)
        } else {
            self.raw.clone()
        }
    }

    pub(crate) fn stripped_raw(&self) -> String {
        delete_signature(&self.raw())
    }
}

impl MessageSignature {
    pub fn raw(&self) -> String {
        if self.raw.is_empty() {
            format!("ARC-Message-Signature: {}", self)
        } else {
            self.raw.clone()
        }
    }

    pub(crate) fn stripped_raw(&self) -> String {
        delete_signature(&self.raw())
    }
}

impl AuthenticationResults {
    pub fn raw(&self) -> String {
        if self.raw.is_empty() {
            format!("ARC-Authentication-Results: {}", self)
        } else {
            self.raw.clone()
        }
    }
}
