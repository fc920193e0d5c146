/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use mail_parser::decoders::base64::base64_decode;

use crate::{Error, Result};

use super::crypto::{HashAlgorithm, PublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    Rsa,
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    All,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorFlag {
    Testing,
    StrictDomain,
}

/// A parsed `<selector>._domainkey.<domain>` TXT record.
#[derive(Debug, Clone)]
pub struct DomainKey {
    pub version: String,
    pub hash_algorithms: Vec<HashAlgorithm>,
    pub key_type: KeyType,
    pub notes: Option<String>,
    pub public_key: PublicKey,
    pub service_types: Vec<ServiceType>,
    pub flags: Vec<SelectorFlag>,
}

impl DomainKey {
    /// Parses a domain-key record. Records without usable `p=` material are
    /// rejected; unknown tags are ignored.
    pub fn parse(record: &str) -> Result<Self> {
        let mut version = String::new();
        let mut hash_algorithms = Vec::new();
        let mut key_type = KeyType::default();
        let mut notes = None;
        let mut service_types = Vec::new();
        let mut flags = Vec::new();
        let mut public_key_b64 = String::new();

        for field in record.split(';') {
            let Some((tag, value)) = field.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match tag.trim() {
                "v" => version = value.to_string(),
                "h" => {
                    for algorithm in value.split(':') {
                        hash_algorithms.push(
                            HashAlgorithm::parse(algorithm.trim())
                                .map_err(|_| Error::InvalidRecordType)?,
                        );
                    }
                }
                "k" => {
                    key_type = match value {
                        "rsa" => KeyType::Rsa,
                        "ed25519" => KeyType::Ed25519,
                        _ => return Err(Error::UnsupportedKeyType),
                    };
                }
                "n" => notes = Some(value.to_string()),
                "p" => public_key_b64 = super::headers::strip_whitespace(value),
                "s" => {
                    for service in value.split(':') {
                        service_types.push(match service.trim() {
                            "*" => ServiceType::All,
                            "email" => ServiceType::Email,
                            _ => return Err(Error::InvalidRecordType),
                        });
                    }
                }
                "t" => {
                    for flag in value.split(':') {
                        flags.push(match flag.trim() {
                            "y" => SelectorFlag::Testing,
                            "s" => SelectorFlag::StrictDomain,
                            _ => return Err(Error::InvalidRecordType),
                        });
                    }
                }
                _ => {}
            }
        }

        if public_key_b64.is_empty() {
            return Err(Error::InvalidRecordType);
        }
        let public_key_der =
            base64_decode(public_key_b64.as_bytes()).ok_or(Error::InvalidRecordType)?;
        let public_key = PublicKey::from_bytes(&public_key_der)?;

        Ok(DomainKey {
            version,
            hash_algorithms,
            key_type,
            notes,
            public_key,
            service_types,
            flags,
        })
    }

    pub fn is_test(&self) -> bool {
        self.flags.contains(&SelectorFlag::Testing)
    }

    /// An absent `s=` tag, or `*`, allows every service.
    pub fn is_service(&self, service: ServiceType) -> bool {
        self.service_types.is_empty()
            || self.service_types.contains(&ServiceType::All)
            || self.service_types.contains(&service)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Result<Arc<DomainKey>>,
    valid_until: Instant,
}

/// DNS resolver with a TTL-bounded domain-key cache. Test builds resolve
/// exclusively from cache entries seeded with [`Resolver::txt_add`].
pub struct Resolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<HashMap<String, CacheEntry>>,
    #[cfg(any(test, feature = "test"))]
    txt_records: Mutex<HashMap<String, Vec<String>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            resolver: TokioAsyncResolver::tokio(
                ResolverConfig::default(),
                ResolverOpts::default(),
            ),
            cache: Mutex::new(HashMap::new()),
            #[cfg(any(test, feature = "test"))]
            txt_records: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_system_conf() -> Result<Self> {
        Ok(Resolver {
            resolver: TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|err| Error::DnsError(err.to_string()))?,
            cache: Mutex::new(HashMap::new()),
            #[cfg(any(test, feature = "test"))]
            txt_records: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up the DKIM key for (selector, domain). The record must carry
    /// `v=DKIM1`.
    pub async fn lookup_dkim_domain_key(
        &self,
        selector: &str,
        domain: &str,
    ) -> Result<Arc<DomainKey>> {
        let key = self.lookup_domain_key(selector, domain).await?;
        if key.version != "DKIM1" {
            return Err(Error::InvalidRecordType);
        }
        Ok(key)
    }

    /// Looks up the ARC key for (selector, domain). A missing `v=` tag is
    /// accepted.
    pub async fn lookup_arc_domain_key(
        &self,
        selector: &str,
        domain: &str,
    ) -> Result<Arc<DomainKey>> {
        self.lookup_domain_key(selector, domain).await
    }

    async fn lookup_domain_key(&self, selector: &str, domain: &str) -> Result<Arc<DomainKey>> {
        let name = format!("{}._domainkey.{}.", selector, domain);

        if let Some(entry) = self.cache_get(&name) {
            return entry;
        }

        // Test builds resolve from the seeded cache only.
        #[cfg(any(test, feature = "test"))]
        if true {
            return Err(Error::DnsRecordNotFound);
        }

        {
            let (result, valid_until) = match self.resolver.txt_lookup(name.as_str()).await {
                Ok(lookup) => {
                    let valid_until = lookup.valid_until();
                    let mut result = Err(Error::DnsRecordNotFound);
                    for txt in lookup.iter() {
                        let record = txt
                            .txt_data()
                            .iter()
                            .flat_map(|data| data.iter().copied())
                            .collect::<Vec<_>>();
                        match DomainKey::parse(&String::from_utf8_lossy(&record)) {
                            Ok(key) => {
                                result = Ok(Arc::new(key));
                                break;
                            }
                            Err(err) => {
                                if matches!(result, Err(Error::DnsRecordNotFound)) {
                                    result = Err(err);
                                }
                            }
                        }
                    }
                    (result, valid_until)
                }
                Err(err) => match err.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => (
                        Err(Error::DnsRecordNotFound),
                        Instant::now() + Duration::from_secs(300),
                    ),
                    _ => {
                        // Transient resolution failures are not cached.
                        return Err(Error::DnsError(err.to_string()));
                    }
                },
            };

            self.cache.lock().unwrap().insert(
                name,
                CacheEntry {
                    result: result.clone(),
                    valid_until,
                },
            );
            result
        }
    }

    /// Raw TXT lookup, one string per record with its character strings
    /// joined. Test builds resolve exclusively from records seeded with
    /// [`Resolver::txt_add_records`].
    pub(crate) async fn txt_lookup(&self, name: &str) -> Result<Vec<String>> {
        #[cfg(any(test, feature = "test"))]
        if true {
            return match self.txt_records.lock().unwrap().get(name) {
                Some(records) => Ok(records.clone()),
                None => Err(Error::DnsRecordNotFound),
            };
        }

        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(Error::DnsRecordNotFound),
                _ => Err(Error::DnsError(err.to_string())),
            },
        }
    }

    fn cache_get(&self, name: &str) -> Option<Result<Arc<DomainKey>>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(name) {
            Some(entry) if entry.valid_until >= Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                cache.remove(name);
                None
            }
            None => None,
        }
    }

    /// Seeds the cache with a record, bypassing DNS. Used by the test
    /// suites.
    #[cfg(any(test, feature = "test"))]
    pub fn txt_add(&self, name: impl Into<String>, record: DomainKey, valid_until: Instant) {
        self.cache.lock().unwrap().insert(
            name.into(),
            CacheEntry {
                result: Ok(Arc::new(record)),
                valid_until,
            },
        );
    }

    /// Seeds raw TXT records for a query name.
    #[cfg(any(test, feature = "test"))]
    pub fn txt_add_records(&self, name: impl Into<String>, records: Vec<String>) {
        self.txt_records.lock().unwrap().insert(name.into(), records);
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resolver")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::test_keys::{TEST_ED25519_PUBLIC_KEY_BASE64, TEST_RSA_PUBLIC_KEY_BASE64};

    #[test]
    fn domain_key_parse() {
        let record = format!(
            "v=DKIM1; h=sha1:sha256; k=rsa; s=*:email; t=y:s; p={}",
            TEST_RSA_PUBLIC_KEY_BASE64
        );
        let key = DomainKey::parse(&record).unwrap();
        assert_eq!(key.version, "DKIM1");
        assert_eq!(
            key.hash_algorithms,
            vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256]
        );
        assert_eq!(key.key_type, KeyType::Rsa);
        assert!(key.is_test());
        assert!(key.flags.contains(&SelectorFlag::StrictDomain));
        assert!(key.is_service(ServiceType::Email));
        assert!(matches!(key.public_key, PublicKey::Rsa(_)));

        let key = DomainKey::parse(&format!(
            "k=ed25519; p={}",
            TEST_ED25519_PUBLIC_KEY_BASE64
        ))
        .unwrap();
        assert_eq!(key.version, "");
        assert_eq!(key.key_type, KeyType::Ed25519);
        assert!(!key.is_test());
        assert!(matches!(key.public_key, PublicKey::Ed25519(_)));
    }

    #[test]
    fn domain_key_parse_rejects() {
        // Missing or empty p=
        assert!(DomainKey::parse("v=DKIM1; k=rsa").is_err());
        assert!(DomainKey::parse("v=DKIM1; p=").is_err());
        // Unknown key type, service, flag or hash
        assert!(DomainKey::parse("k=dsa; p=AAAA").is_err());
        assert!(
            DomainKey::parse(&format!("s=web; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).is_err()
        );
        assert!(
            DomainKey::parse(&format!("t=x; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).is_err()
        );
        assert!(
            DomainKey::parse(&format!("h=md5; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).is_err()
        );
    }

    #[test]
    fn service_defaults_to_all() {
        let key =
            DomainKey::parse(&format!("v=DKIM1; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).unwrap();
        assert!(key.is_service(ServiceType::Email));
        assert!(key.is_service(ServiceType::All));
    }

    #[tokio::test]
    async fn lookup_uses_cache_and_version_gate() {
        let resolver = Resolver::new();

        // Nothing seeded: test builds never touch the network.
        assert_eq!(
            resolver
                .lookup_arc_domain_key("default", "example.jp")
                .await
                .unwrap_err(),
            Error::DnsRecordNotFound
        );

        let dkim1 =
            DomainKey::parse(&format!("v=DKIM1; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).unwrap();
        resolver.txt_add(
            "default._domainkey.example.jp.",
            dkim1,
            Instant::now() + Duration::from_secs(3600),
        );
        assert!(resolver
            .lookup_dkim_domain_key("default", "example.jp")
            .await
            .is_ok());

        // Versionless record: fine for ARC, rejected for DKIM.
        let versionless =
            DomainKey::parse(&format!("p={}", TEST_RSA_PUBLIC_KEY_BASE64)).unwrap();
        resolver.txt_add(
            "arc._domainkey.example.jp.",
            versionless,
            Instant::now() + Duration::from_secs(3600),
        );
        assert!(resolver
            .lookup_arc_domain_key("arc", "example.jp")
            .await
            .is_ok());
        assert_eq!(
            resolver
                .lookup_dkim_domain_key("arc", "example.jp")
                .await
                .unwrap_err(),
            Error::InvalidRecordType
        );

        // Expired entries fall out of the cache.
        let expired =
            DomainKey::parse(&format!("v=DKIM1; p={}", TEST_RSA_PUBLIC_KEY_BASE64)).unwrap();
        resolver.txt_add(
            "old._domainkey.example.jp.",
            expired,
            Instant::now() - Duration::from_secs(1),
        );
        assert_eq!(
            resolver
                .lookup_dkim_domain_key("old", "example.jp")
                .await
                .unwrap_err(),
            Error::DnsRecordNotFound
        );
    }
}
