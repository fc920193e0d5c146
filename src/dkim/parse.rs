/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use crate::common::canonical::parse_canonicalization_pair;
use crate::common::crypto::Algorithm;
use crate::common::headers::{parse_header_field, parse_header_params, strip_whitespace};
use crate::{Error, Result};

use super::Signature;

impl Signature {
    /// Parses a complete DKIM-Signature header line, retaining the raw
    /// bytes. Records missing a mandatory tag are rejected.
    pub fn parse(header: &str) -> Result<Self> {
        let (name, value) = parse_header_field(header);
        if !name.eq_ignore_ascii_case("dkim-signature") {
            return Err(Error::ParseError("not a DKIM-Signature header".to_string()));
        }

        let mut signature = Signature {
            raw: header.to_string(),
            ..Default::default()
        };
        let mut canonicalization = String::new();
        let mut has_version = false;
        let mut has_algorithm = false;

        for (tag, value) in parse_header_params(value)? {
            let value = strip_whitespace(&value);
            match tag.as_str() {
                "a" => {
                    signature.a = Algorithm::parse(&value)?;
                    has_algorithm = true;
                }
                "b" => signature.b = value,
                "bh" => signature.bh = value,
                "c" => canonicalization = value,
                "d" => signature.d = value,
                "h" => signature.h = value,
                "i" => signature.i = value,
                "l" => {
                    signature.l = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 'l={}'", value)))?;
                }
                "q" => signature.q = value,
                "s" => signature.s = value,
                "t" => {
                    signature.t = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 't={}'", value)))?;
                }
                "v" => {
                    signature.v = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 'v={}'", value)))?;
                    has_version = true;
                }
                "x" => {
                    signature.x = value
                        .parse()
                        .map_err(|_| Error::ParseError(format!("invalid 'x={}'", value)))?;
                }
                _ => {}
            }
        }

        if !has_version
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

    /// The raw header line as it appeared in the message, or the serialized
    /// form for signatures built locally.
    pub fn raw(&self) -> String {
        if self.raw.is_empty() {
            format!("DKIM-Signature: {}", self)
        } else {
            self.raw.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::canonical::Canonicalization;

    #[test]
    fn dkim_signature_parse() {
        let header = concat!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed; d=example.com;\r\n",
            "        s=selector; t=1706971004; x=1706974604; l=120; i=hoge@example.com;\r\n",
            "        h=Date:From:To:Subject:Message-Id;\r\n",
            "        bh=XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=;\r\n",
            "        b=ZeWS0mo8KKL0Y0V2Cbzj4E2R\r\n",
            "         9ZRE92GPnSYUb8xZAB8hhx6sTNgYQjnJIU3pmNEz\r\n",
        );
        let signature = Signature::parse(header).unwrap();
        assert_eq!(signature.v, 1);
        assert_eq!(signature.a, Algorithm::RsaSha256);
        assert_eq!(signature.ch, Canonicalization::Relaxed);
        assert_eq!(signature.cb, Canonicalization::Relaxed);
        assert_eq!(signature.d, "example.com");
        assert_eq!(signature.s, "selector");
        assert_eq!(signature.t, 1706971004);
        assert_eq!(signature.x, 1706974604);
        assert_eq!(signature.l, 120);
        assert_eq!(signature.i, "hoge@example.com");
        assert_eq!(signature.h, "Date:From:To:Subject:Message-Id");
        assert_eq!(signature.bh, "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=");
        // Folding whitespace is stripped from b= but preserved in raw.
        assert_eq!(
            signature.b,
            "ZeWS0mo8KKL0Y0V2Cbzj4E2R9ZRE92GPnSYUb8xZAB8hhx6sTNgYQjnJIU3pmNEz"
        );
        assert_eq!(signature.raw(), header);
    }

    #[test]
    fn single_canonicalization_token_applies_to_header() {
        let header = concat!(
            "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed; d=example.com; s=sel; ",
            "h=from; bh=hash; b=sig",
        );
        let signature = Signature::parse(header).unwrap();
        assert_eq!(signature.ch, Canonicalization::Relaxed);
        assert_eq!(signature.cb, Canonicalization::Simple);

        // No c= tag at all defaults to simple/simple.
        let header =
            "DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=sel; h=from; bh=hash; b=sig";
        let signature = Signature::parse(header).unwrap();
        assert_eq!(signature.ch, Canonicalization::Simple);
        assert_eq!(signature.cb, Canonicalization::Simple);
    }

    #[test]
    fn dkim_signature_parse_rejects() {
        // Negative or non-numeric l=
        for l in ["-1", "12a"] {
            let header = format!(
                "DKIM-Signature: v=1; a=rsa-sha256; d=d; s=s; h=from; bh=x; b=y; l={}",
                l
            );
            assert!(Signature::parse(&header).is_err(), "l={}", l);
        }

        // Unknown algorithm
        assert!(Signature::parse(
            "DKIM-Signature: v=1; a=rsa-md5; d=d; s=s; h=from; bh=x; b=y"
        )
        .is_err());

        // Missing mandatory tags
        for header in [
            "DKIM-Signature: a=rsa-sha256; d=d; s=s; h=from; bh=x; b=y",
            "DKIM-Signature: v=1; d=d; s=s; h=from; bh=x; b=y",
            "DKIM-Signature: v=1; a=rsa-sha256; s=s; h=from; bh=x; b=y",
            "DKIM-Signature: v=1; a=rsa-sha256; d=d; h=from; bh=x; b=y",
            "DKIM-Signature: v=1; a=rsa-sha256; d=d; s=s; h=from; b=y",
            "DKIM-Signature: v=1; a=rsa-sha256; d=d; s=s; h=from; bh=x",
        ] {
            assert!(Signature::parse(header).is_err(), "{header}");
        }

        // Unknown tags are ignored.
        assert!(Signature::parse(
            "DKIM-Signature: v=1; a=rsa-sha256; d=d; s=s; h=from; bh=x; b=y; zz=ignored"
        )
        .is_ok());

        // Wrong header name
        assert!(Signature::parse("X-Header: v=1").is_err());
    }
}
