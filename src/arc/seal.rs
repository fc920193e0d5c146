/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use mail_parser::decoders::base64::base64_decode;

use crate::common::canonical::Canonicalization;
use crate::common::crypto::PrivateKey;
use crate::common::headers::{header_preimage, sign_headers};
use crate::common::resolver::DomainKey;
use crate::dkim::verify::now_unix;
use crate::{Result, VerifyResult, VerifyStatus};

use super::Seal;

impl Seal {
    /// Signs the chain. `headers` is the Seal pre-image in seal order up to
    /// and including this instance's AAR and AMS; the seal itself is
    /// appended with an empty `b=`. Seal canonicalization is always relaxed.
    pub fn sign(&mut self, headers: &[String], key: &PrivateKey) -> Result<()> {
        self.sign_at(headers, key, now_unix())
    }

    pub(crate) fn sign_at(&mut self, headers: &[String], key: &PrivateKey, now: u64) -> Result<()> {
        if self.t == 0 {
            self.t = now;
        }
        let mut signed = headers.to_vec();
        signed.push(format!("ARC-Seal: {}", self));
        self.b = sign_headers(&signed, Canonicalization::Relaxed, key)?;
        Ok(())
    }

    /// Verifies the seal over the given pre-image headers (everything the
    /// seal covers except the seal itself).
    pub(crate) fn verify_with_key(
        &self,
        arc_headers: &[String],
        domain_key: &DomainKey,
    ) -> VerifyResult {
        if self.raw.is_empty() {
            return VerifyResult::new(VerifyStatus::Neutral, "seal is not found");
        }

        let mut signed = arc_headers.to_vec();
        signed.push(self.stripped_raw());
        let preimage = header_preimage(&signed, Canonicalization::Relaxed);

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
