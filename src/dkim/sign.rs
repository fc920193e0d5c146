/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::time::SystemTime;

use crate::common::crypto::PrivateKey;
use crate::common::headers::sign_headers;
use crate::{Error, Result};

use super::Signature;

impl Signature {
    /// Signs the given pre-selected headers, filling in `h=`, `t=` and `b=`.
    /// The signature covers the headers in the order given plus this header
    /// itself with an empty `b=` value.
    pub fn sign(&mut self, headers: &[String], key: &PrivateKey) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        self.sign_at(headers, key, now)
    }

    pub(crate) fn sign_at(&mut self, headers: &[String], key: &PrivateKey, now: u64) -> Result<()> {
        if self.v != 1 {
            return Err(Error::UnsupportedVersion);
        }
        if headers.is_empty() {
            return Err(Error::NoHeadersFound);
        }

        self.h = headers
            .iter()
            .filter_map(|header| header.split_once(':').map(|(name, _)| name))
            .collect::<Vec<_>>()
            .join(":");
        if self.t == 0 {
            self.t = now;
        }

        let mut signed = headers.to_vec();
        signed.push(format!("DKIM-Signature: {}", self));
        self.b = sign_headers(&signed, self.ch, key)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::canonical::Canonicalization;
    use crate::common::crypto::Algorithm;
    use crate::common::test_keys::rsa_key;

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

    #[test]
    fn sign_fills_headers_and_signature() {
        let mut signature = Signature {
            v: 1,
            a: Algorithm::RsaSha256,
            bh: "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=".to_string(),
            ch: Canonicalization::Relaxed,
            cb: Canonicalization::Relaxed,
            d: "example.com".to_string(),
            s: "selector".to_string(),
            t: 1706971004,
            ..Default::default()
        };

        signature
            .sign_at(&test_headers(), &rsa_key(), 1706971004)
            .unwrap();

        assert_eq!(signature.h, "Date:From:To:Subject:Message-Id");
        assert_eq!(
            signature.b,
            concat!(
                "kd8wPYuBn0/CA5IJccxBQx/0Hn4dHUR5t/l7yITnT9WZxxyulqecojaRQB33Csoh",
                "Pe8g05AImS6VBHWO83Oho7YnW19k8jel/nnXe5khlQ7Y/D2OdS/AlpZ2ad8yFSYB",
                "da1rWAoTKdMNTWm5mTnsr5jcY8U1JMaKWByXCcuh0d5YcXtEPmX+Hlwz/qUykrRP",
                "B3mAceuR3UNMvqQ0Q5ttKuJDYRJCO6TD/y/JI7yMEMhKGwc/9alrqh/qYzzhcJQk",
                "omNSSWcU6Ji65f67JVZKeqe8ROK5BLNDljzDQpc0Qk2xcbjugQAkLpdsJjPaAqfM",
                "NPPdKuTcDjFMjUpnyfuQYA==",
            )
        );
    }

    #[test]
    fn sign_requires_version() {
        let mut signature = Signature {
            d: "example.com".to_string(),
            s: "selector".to_string(),
            ..Default::default()
        };
        assert_eq!(
            signature.sign_at(&test_headers(), &rsa_key(), 1706971004),
            Err(Error::UnsupportedVersion)
        );

        signature.v = 1;
        assert_eq!(
            signature.sign_at(&[], &rsa_key(), 1706971004),
            Err(Error::NoHeadersFound)
        );
    }

    #[test]
    fn sign_sets_timestamp_when_unset() {
        let mut signature = Signature {
            v: 1,
            a: Algorithm::RsaSha256,
            bh: "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=".to_string(),
            ch: Canonicalization::Relaxed,
            cb: Canonicalization::Relaxed,
            d: "example.com".to_string(),
            s: "selector".to_string(),
            ..Default::default()
        };
        signature
            .sign_at(&test_headers(), &rsa_key(), 1728300596)
            .unwrap();
        assert_eq!(signature.t, 1728300596);
        assert!(!signature.b.is_empty());
    }
}
