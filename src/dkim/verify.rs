/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::sync::Arc;
use std::time::SystemTime;

use mail_parser::decoders::base64::base64_decode;

use crate::common::headers::{
    delete_signature, extract_header, extract_headers_dkim, header_preimage,
    parse_address_domain,
};
use crate::common::resolver::{DomainKey, Resolver, ServiceType};
use crate::{Error, VerifyResult, VerifyStatus};

use super::Signature;

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Maps a domain-key lookup failure onto a verification verdict.
pub(crate) fn lookup_error_result(err: &Error) -> VerifyResult {
    match err {
        Error::DnsRecordNotFound => {
            VerifyResult::new(VerifyStatus::PermError, "domain key is not found")
        }
        Error::DnsError(_) => {
            VerifyResult::new(VerifyStatus::TempError, "failed to lookup domain key")
        }
        _ => VerifyResult::new(VerifyStatus::PermError, "invalid domain key"),
    }
}

impl Signature {
    /// Verifies this signature against the message headers and the matching
    /// body hash, fetching the public key over DNS. The verdict is recorded
    /// on the signature.
    pub async fn verify(&mut self, headers: &[String], body_hash: &str, resolver: &Resolver) {
        match resolver.lookup_dkim_domain_key(&self.s, &self.d).await {
            Ok(domain_key) => {
                self.verify_with_key_at(headers, body_hash, domain_key, now_unix());
            }
            Err(err) => {
                self.verify_result = Some(lookup_error_result(&err));
            }
        }
    }

    /// Verifies against an already fetched domain key.
    pub fn verify_with_key(
        &mut self,
        headers: &[String],
        body_hash: &str,
        domain_key: Arc<DomainKey>,
    ) {
        self.verify_with_key_at(headers, body_hash, domain_key, now_unix());
    }

    pub(crate) fn verify_with_key_at(
        &mut self,
        headers: &[String],
        body_hash: &str,
        domain_key: Arc<DomainKey>,
        now: u64,
    ) {
        let suffix = if domain_key.is_test() { " test mode" } else { "" };
        let verdict = |status, message: &str| {
            VerifyResult::new(status, format!("{}{}", message, suffix))
                .with_domain_key(Some(domain_key.clone()))
        };

        if self.raw.is_empty() {
            self.verify_result = Some(verdict(VerifyStatus::Neutral, "sign is not found"));
            return;
        }
        if self.v != 1 {
            self.verify_result = Some(verdict(VerifyStatus::PermError, "version is invalid"));
            return;
        }
        if self.x != 0 {
            if now > self.x {
                self.verify_result = Some(verdict(VerifyStatus::Fail, "signature is expired"));
                return;
            }
            if self.t > self.x {
                self.verify_result =
                    Some(verdict(VerifyStatus::PermError, "timestamp is invalid"));
                return;
            }
        }

        if !self.i.is_empty() {
            let from = extract_header(headers, "From").unwrap_or_default();
            let from_domain = match parse_address_domain(&from) {
                Ok(domain) => domain,
                Err(_) => {
                    self.verify_result =
                        Some(verdict(VerifyStatus::PermError, "failed to parse from domain"));
                    return;
                }
            };
            // Subdomain identities are accepted via suffix match.
            if !self.i.ends_with(&format!("@{}", from_domain))
                && !self.i.ends_with(&format!(".{}", from_domain))
            {
                self.verify_result = Some(verdict(VerifyStatus::Fail, "identity is mismatch"));
                return;
            }
        }

        if !domain_key.is_service(ServiceType::Email) {
            self.verify_result = Some(verdict(VerifyStatus::PermError, "service type is invalid"));
            return;
        }

        if self.bh != body_hash {
            self.verify_result = Some(verdict(VerifyStatus::Fail, "body hash is not match"));
            return;
        }

        let mut signed = extract_headers_dkim(headers, &self.h.split(':').collect::<Vec<_>>());
        signed.push(delete_signature(&self.raw));
        let preimage = header_preimage(&signed, self.ch);

        let signature = match base64_decode(self.b.as_bytes()) {
            Some(signature) => signature,
            None => {
                self.verify_result = Some(verdict(VerifyStatus::Fail, "invalid signature"));
                return;
            }
        };

        self.verify_result = Some(
            match domain_key
                .public_key
                .verify(self.a.hash_algorithm(), &preimage, &signature)
            {
                Ok(()) => verdict(VerifyStatus::Pass, "good signature"),
                Err(_) => verdict(VerifyStatus::Fail, "invalid signature"),
            },
        );
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::common::canonical::Canonicalization;
    use crate::common::crypto::Algorithm;
    use crate::common::test_keys::{rsa_key, TEST_RSA_PUBLIC_KEY_BASE64};

    const BODY_HASH: &str = "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=";

    fn test_headers() -> Vec<String> {
        [
            "Date: Sat, 03 Feb 2024 23:36:43 +0900\r\n",
            "From: hogefuga@example.com\r\n",
            "To: aaa@example.org\r\n",
            "Subject: test\r\n",
            "Message-Id: <20240203233642.F020.87DC113@example.com>\r\n",
        ]
        .iter()
        .map(|header| header.to_string())
        .collect()
    }

    fn signed_fixture() -> (Vec<String>, Signature) {
        let mut headers = test_headers();
        let mut signature = Signature {
            v: 1,
            a: Algorithm::RsaSha256,
            bh: BODY_HASH.to_string(),
            ch: Canonicalization::Relaxed,
            cb: Canonicalization::Relaxed,
            d: "example.com".to_string(),
            s: "selector".to_string(),
            t: 1706971004,
            ..Default::default()
        };
        signature
            .sign_at(&headers, &rsa_key(), 1706971004)
            .unwrap();

        let raw = format!("DKIM-Signature: {}", signature);
        headers.push(raw.clone());
        let parsed = Signature::parse(&raw).unwrap();
        (headers, parsed)
    }

    fn domain_key(record_suffix: &str) -> Arc<crate::common::resolver::DomainKey> {
        Arc::new(
            crate::common::resolver::DomainKey::parse(&format!(
                "v=DKIM1; {}p={}",
                record_suffix, TEST_RSA_PUBLIC_KEY_BASE64
            ))
            .unwrap(),
        )
    }

    #[test]
    fn verify_good_signature() {
        let (headers, mut signature) = signed_fixture();
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971004);
        let result = signature.verify_result.as_ref().unwrap();
        assert_eq!(result.status(), VerifyStatus::Pass);
        assert_eq!(result.message(), "good signature");
    }

    #[test]
    fn verify_good_signature_test_mode() {
        let (headers, mut signature) = signed_fixture();
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key("t=y; "), 1706971004);
        let result = signature.verify_result.as_ref().unwrap();
        assert_eq!(result.status(), VerifyStatus::Pass);
        assert_eq!(result.message(), "good signature test mode");
    }

    #[test]
    fn verify_body_hash_mismatch() {
        let (headers, mut signature) = signed_fixture();
        signature.verify_with_key_at(&headers, "bogus", domain_key(""), 1706971004);
        let result = signature.verify_result.as_ref().unwrap();
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "body hash is not match");
    }

    #[test]
    fn verify_tampered_signature() {
        let (mut headers, mut signature) = signed_fixture();
        // Another Subject wins header selection and breaks the pre-image.
        headers.push("Subject: injected\r\n".to_string());
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971004);
        let result = signature.verify_result.as_ref().unwrap();
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "invalid signature");
    }

    #[test]
    fn verify_expiration() {
        let (headers, mut signature) = signed_fixture();
        signature.x = 1706971010;
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971011);
        assert_eq!(
            signature.verify_result.as_ref().unwrap().status(),
            VerifyStatus::Fail
        );
        assert_eq!(
            signature.verify_result.as_ref().unwrap().message(),
            "signature is expired"
        );

        // Timestamp after expiration is a permanent error.
        signature.t = 1706971020;
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971000);
        assert_eq!(
            signature.verify_result.as_ref().unwrap().status(),
            VerifyStatus::PermError
        );
    }

    #[test]
    fn verify_identity_alignment() {
        let (headers, mut signature) = signed_fixture();
        signature.i = "user@mail.example.com".to_string();
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971004);
        // Subdomain identity is accepted; the pre-image check still runs
        // against the unchanged raw header, so the result reflects b=.
        assert_ne!(
            signature.verify_result.as_ref().unwrap().message(),
            "identity is mismatch"
        );

        signature.i = "user@another.example".to_string();
        signature.verify_with_key_at(&headers, BODY_HASH, domain_key(""), 1706971004);
        let result = signature.verify_result.as_ref().unwrap();
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "identity is mismatch");
    }

    #[test]
    fn verify_service_type() {
        let (headers, mut signature) = signed_fixture();
        // An explicit s=email grants the mail service.
        let key = Arc::new(
            crate::common::resolver::DomainKey::parse(&format!(
                "v=DKIM1; s=email; p={}",
                TEST_RSA_PUBLIC_KEY_BASE64
            ))
            .unwrap(),
        );
        signature.verify_with_key_at(&headers, BODY_HASH, key, 1706971004);
        assert_eq!(
            signature.verify_result.as_ref().unwrap().status(),
            VerifyStatus::Pass
        );
    }

    #[tokio::test]
    async fn verify_with_resolver() {
        let resolver = Resolver::new();
        let (headers, mut signature) = signed_fixture();

        // No record published: permanent error.
        signature.verify(&headers, BODY_HASH, &resolver).await;
        assert_eq!(
            signature.verify_result.as_ref().unwrap().status(),
            VerifyStatus::PermError
        );
        assert_eq!(
            signature.verify_result.as_ref().unwrap().message(),
            "domain key is not found"
        );

        resolver.txt_add(
            "selector._domainkey.example.com.",
            crate::common::resolver::DomainKey::parse(&format!(
                "v=DKIM1; p={}",
                TEST_RSA_PUBLIC_KEY_BASE64
            ))
            .unwrap(),
            Instant::now() + Duration::from_secs(3600),
        );
        signature.verify(&headers, BODY_HASH, &resolver).await;
        assert_eq!(
            signature.verify_result.as_ref().unwrap().status(),
            VerifyStatus::Pass
        );
    }
}
