/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use crate::common::canonical::parse_canonicalization_pair;
use crate::common::crypto::Algorithm;
use crate::common::headers::{parse_header_field, strip_whitespace};
use crate::{Error, Result};

use super::{
    ArcChain, AuthenticationResults, ChainValidation, MessageSignature, Seal, MAX_INSTANCE,
};

fn parse_instance(value: &str) -> Result<u32> {
    let instance = value
        .parse::<u32>()
        .map_err(|_| Error::ParseError(format!("invalid 'i={}'", value)))?;
    if instance == 0 || instance > MAX_INSTANCE {
        return Err(Error::ArcInvalidInstance(instance));
    }
    Ok(instance)
}

impl Seal {
    pub fn parse(header: &str) -> Result<Self> {
        let (name, value) = parse_header_field(header);
        if !name.eq_ignore_ascii_case("arc-seal") {
            return Err(Error::ParseError("not an ARC-Seal header".to_string()));
        }

        let mut seal = Seal {
            raw: header.to_string(),
            ..Default::default()
        };
        let mut has_algorithm = false;

        for field in value.split(';') {
            let Some((tag, value)) = field.trim().split_once('=') else {
                continue;
            };
            let value = strip_whitespace(value);
            match tag.trim() {
                "i" => seal.i = parse_instance(&value)?,
                "a" => {
                    seal.a = Algorithm::parse(&value)?;
                    has_algorithm = true;
                }
                "b" => seal.b = value,
                "cv" => seal.cv = Some(ChainValidation::parse(&value)?),
                "d" => seal.d = value,
                "s" => seal.s = value,
                "t" => {
                    seal.t = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 't={}'", value)))?;
                }
                _ => {}
            }
        }

        if seal.i == 0
            || !has_algorithm
            || seal.d.is_empty()
            || seal.s.is_empty()
            || seal.b.is_empty()
        {
            return Err(Error::MissingParameters);
        }

        Ok(seal)
    }
}

impl MessageSignature {
    pub fn parse(header: &str) -> Result<Self> {
        let (name, value) = parse_header_field(header);
        if !name.eq_ignore_ascii_case("arc-message-signature") {
            return Err(Error::ParseError(
                "not an ARC-Message-Signature header".to_string(),
            ));
        }

        let mut signature = MessageSignature {
            raw: header.to_string(),
            ..Default::default()
        };
        let mut canonicalization = String::new();
        let mut has_algorithm = false;

        for field in value.split(';') {
            let Some((tag, value)) = field.trim().split_once('=') else {
                continue;
            };
            let value = strip_whitespace(value);
            match tag.trim() {
                "i" => signature.i = parse_instance(&value)?,
                "a" => {
                    signature.a = Algorithm::parse(&value)?;
                    has_algorithm = true;
                }
                "b" => signature.b = value,
                "bh" => signature.bh = value,
                "c" => canonicalization = value,
                "d" => signature.d = value,
                "h" => signature.h = value,
                "s" => signature.s = value,
                "t" => {
                    signature.t = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 't={}'", value)))?;
                }
                _ => {}
            }
        }

        if signature.i == 0
            || !has_algorithm
            || signature.d.is_empty()
            || signature.s.is_empty()
            || signature.b.is_empty()
            || signature.bh.is_empty()
        {
            return Err(Error::MissingParameters);
        }

        let (ch, cb) = parse_canonicalization_pair(&canonicalization)?;
        signature.ch = ch;
        signature.cb = cb;

        Ok(signature)
    }
}

impl AuthenticationResults {
    pub fn parse(header: &str) -> Result<Self> {
        let (name, value) = parse_header_field(header);
        if !name.eq_ignore_ascii_case("arc-authentication-results") {
            return Err(Error::ParseError(
                "not an ARC-Authentication-Results header".to_string(),
            ));
        }

        let mut results = AuthenticationResults {
            raw: header.to_string(),
            ..Default::default()
        };

        for (index, field) in value.split(';').enumerate() {
            let field = field.trim();
            // The authserv-id sits right after the instance tag.
            if index == 1 {
                results.authserv_id = field
                    .split_once('=')
                    .map(|(id, _)| id)
                    .unwrap_or(field)
                    .trim()
                    .to_string();
                continue;
            }
            let Some((tag, value)) = field.split_once('=') else {
                continue;
            };
            let (tag, value) = (tag.trim(), value.trim());
            if tag == "i" {
                results.i = parse_instance(value)?;
            } else {
                results.results.push(format!("{}={}", tag, value));
            }
        }

        if results.i == 0 {
            return Err(Error::MissingParameters);
        }

        Ok(results)
    }
}

impl ArcChain {
    /// Indexes every ARC header of the message by instance. Unparseable
    /// records, instances out of 1..=50, gaps, and incomplete triples all
    /// mark the chain as malformed.
    pub fn parse(headers: &[String]) -> Self {
        let mut chain = ArcChain::default();

        for header in headers {
            let (name, _) = parse_header_field(header);
            if name.eq_ignore_ascii_case("arc-seal") {
                match Seal::parse(header) {
                    Ok(seal) => {
                        let i = seal.i;
                        chain.entry(i).seal = Some(seal);
                    }
                    Err(err) => {
                        log::debug!("malformed ARC-Seal: {}", err);
                        chain.malformed = true;
                    }
                }
            } else if name.eq_ignore_ascii_case("arc-message-signature") {
                match MessageSignature::parse(header) {
                    Ok(signature) => {
                        let i = signature.i;
                        chain.entry(i).message_signature = Some(signature);
                    }
                    Err(err) => {
                        log::debug!("malformed ARC-Message-Signature: {}", err);
                        chain.malformed = true;
                    }
                }
            } else if name.eq_ignore_ascii_case("arc-authentication-results") {
                match AuthenticationResults::parse(header) {
                    Ok(results) => {
                        let i = results.i;
                        chain.entry(i).results = Some(results);
                    }
                    Err(err) => {
                        log::debug!("malformed ARC-Authentication-Results: {}", err);
                        chain.malformed = true;
                    }
                }
            }
        }

        // Instances must be contiguous from 1 with all three siblings.
        for instance in 1..=chain.max_instance() {
            match chain.get_instance(instance) {
                Some(set) if set.is_complete() => {}
                _ => chain.malformed = true,
            }
        }

        chain
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seal_parse_folded() {
        let header = concat!(
            "ARC-Seal: i=1; a=rsa-sha256; t=1706971004; cv=none;\r\n",
            "        d=example.com; s=selector;\r\n",
            "        b=g+R0nyap1H1wsIqc3AvSesOyicLqq/p5bMP4yJUG/Kqmb8iN42MuYVdjD8xFNiPg\r\n",
            "         gfmq2Uz/FvYsyq9vx8R9Isxu0eNKyx4tZWMK0kNJkxW/cA+RRPZ1sSXxI2w+ZomV\r\n",
        );
        let seal = Seal::parse(header).unwrap();
        assert_eq!(seal.i, 1);
        assert_eq!(seal.a, Algorithm::RsaSha256);
        assert_eq!(seal.cv, Some(ChainValidation::None));
        assert_eq!(seal.d, "example.com");
        assert_eq!(seal.s, "selector");
        assert_eq!(seal.t, 1706971004);
        assert_eq!(
            seal.b,
            concat!(
                "g+R0nyap1H1wsIqc3AvSesOyicLqq/p5bMP4yJUG/Kqmb8iN42MuYVdjD8xFNiPg",
                "gfmq2Uz/FvYsyq9vx8R9Isxu0eNKyx4tZWMK0kNJkxW/cA+RRPZ1sSXxI2w+ZomV",
            )
        );
        assert_eq!(seal.raw(), header);
    }

    #[test]
    fn seal_parse_rejects() {
        // Invalid cv token
        assert!(Seal::parse("ARC-Seal: i=1; a=rsa-sha256; cv=maybe; d=d; s=s; b=x").is_err());
        // Instance over the cap or zero
        assert!(Seal::parse("ARC-Seal: i=51; a=rsa-sha256; cv=none; d=d; s=s; b=x").is_err());
        assert!(Seal::parse("ARC-Seal: i=0; a=rsa-sha256; cv=none; d=d; s=s; b=x").is_err());
        // Missing selector
        assert!(Seal::parse("ARC-Seal: i=1; a=rsa-sha256; cv=none; d=d; b=x").is_err());
    }

    #[test]
    fn message_signature_parse() {
        let header = concat!(
            "ARC-Message-Signature: i=1; a=rsa-sha256; c=simple/simple; d=example.com; s=selector;\r\n",
            "        h=Date:From:To:Subject:Message-Id;\r\n",
            "        bh=XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=; t=1706971004;\r\n",
            "        b=ZeWS0mo8KKL0Y0V2Cbzj4E2R9ZRE92GPnSYUb8xZAB8hhx6sTNgYQjnJIU3pmNEz\r\n",
        );
        let signature = MessageSignature::parse(header).unwrap();
        assert_eq!(signature.i, 1);
        assert_eq!(signature.ch, crate::common::canonical::Canonicalization::Simple);
        assert_eq!(signature.cb, crate::common::canonical::Canonicalization::Simple);
        assert_eq!(signature.h, "Date:From:To:Subject:Message-Id");
        assert_eq!(signature.bh, "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=");
        assert_eq!(signature.t, 1706971004);
    }

    #[test]
    fn authentication_results_parse() {
        let results = AuthenticationResults::parse(
            "ARC-Authentication-Results: i=2; example.com ; arc=pass; spf=pass\r\n",
        )
        .unwrap();
        assert_eq!(results.i, 2);
        assert_eq!(results.authserv_id, "example.com");
        assert_eq!(results.results, vec!["arc=pass", "spf=pass"]);
    }

    #[test]
    fn chain_structural_invariants() {
        let complete = |instance: u32| {
            vec![
                format!("ARC-Seal: i={instance}; a=rsa-sha256; cv=pass; d=d; s=s; b=x\r\n"),
                format!("ARC-Message-Signature: i={instance}; a=rsa-sha256; d=d; s=s; bh=y; b=x; h=from\r\n"),
                format!("ARC-Authentication-Results: i={instance}; example.com; spf=pass\r\n"),
            ]
        };

        // Gap: instances 1 and 3 only.
        let mut headers = complete(1);
        headers.extend(complete(3));
        let chain = ArcChain::parse(&headers);
        assert!(chain.is_malformed());
        assert_eq!(chain.chain_validation(), ChainValidation::Fail);

        // Missing sibling.
        let headers =
            vec!["ARC-Seal: i=1; a=rsa-sha256; cv=none; d=d; s=s; b=x\r\n".to_string()];
        let chain = ArcChain::parse(&headers);
        assert!(chain.is_malformed());
        assert_eq!(chain.chain_validation(), ChainValidation::Fail);

        // An unparseable record poisons the chain.
        let mut headers = complete(1);
        headers.push("ARC-Seal: i=not-a-number; cv=none\r\n".to_string());
        let chain = ArcChain::parse(&headers);
        assert!(chain.is_malformed());

        // A complete single instance is intact.
        let chain = ArcChain::parse(&complete(1));
        assert!(!chain.is_malformed());
        assert_eq!(chain.max_instance(), 1);
    }
}
