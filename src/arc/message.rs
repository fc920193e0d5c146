/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use mail_parser::decoders::base64::base64_decode;

use crate::common::crypto::PrivateKey;
use crate::common::headers::{extract_headers_arc, header_preimage, sign_headers};
use crate::common::resolver::DomainKey;
use crate::dkim::verify::now_unix;
use crate::{Error, Result, VerifyResult, VerifyStatus};

use super::MessageSignature;

impl MessageSignature {
    /// Signs the pre-selected headers, filling in `h=`, `t=` and `b=`. Each
    /// distinct header name is recorded once.
    pub fn sign(&mut self, headers: &[String], key: &PrivateKey) -> Result<()> {
        self.sign_at(headers, key, now_unix())
    }

    pub(crate) fn sign_at(&mut self, headers: &[String], key: &PrivateKey, now: u64) -> Result<()> {
        if headers.is_empty() {
            return Err(Error::NoHeadersFound);
        }
        let mut names: Vec<&str> = Vec::new();
        for header in headers {
            if let Some((name, _)) = header.split_once(':') {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        self.h = names.join(":");
        if self.t == 0 {
            self.t = now;
        }

        let mut signed = headers.to_vec();
        signed.push(format!("ARC-Message-Signature: {}", self));
        self.b = sign_headers(&signed, self.ch, key)?;
        Ok(())
    }

    /// Verifies this AMS against the message headers and the matching body
    /// hash.
    pub(crate) fn verify_with_key(
        &self,
        headers: &[String],
        body_hash: &str,
        domain_key: &DomainKey,
        _now: u64,
    ) -> VerifyResult {
        if self.raw.is_empty() {
            return VerifyResult::new(VerifyStatus::Neutral, "sign is not found");
        }

        if self.bh != body_hash {
            return VerifyResult::new(VerifyStatus::Fail, "body hash is not match");
        }

        let names = self.h.split(':').collect::<Vec<_>>();
        // A signature covering ARC-Seal can never survive sealing.
        if names
            .iter()
            .any(|name| name.trim().eq_ignore_ascii_case("arc-seal"))
        {
            return VerifyResult::new(VerifyStatus::PermError, "ARC-Seal is found");
        }

        let mut signed = extract_headers_arc(headers, &names);
        signed.push(self.stripped_raw());
        let preimage = header_preimage(&signed, self.ch);

        let signature = match base64_decode(self.b.as_bytes()) {
            Some(signature) => signature,
            None => return VerifyResult::new(VerifyStatus::PermError, "invalid signature"),
        };

        match domain_key
            .public_key
            .verify(self.a.hash_algorithm(), &preimage, &signature)
        {
            Ok(()) => VerifyResult::new(VerifyStatus::Pass, "good signature"),
            Err(_) => VerifyResult::new(VerifyStatus::Fail, "invalid signature"),
        }
    }
}
