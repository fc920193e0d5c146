/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! DMARC record codec and `_dmarc` lookup. Policy evaluation and
//! enforcement belong to the MTA; the session pipeline does not consult
//! this module.

use crate::common::resolver::Resolver;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    #[default]
    Relaxed,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Policy::None),
            "quarantine" => Ok(Policy::Quarantine),
            "reject" => Ok(Policy::Reject),
            _ => Err(Error::InvalidRecordType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOption {
    AllFail,
    AnyFail,
    DkimOnly,
    SpfOnly,
}

/// A `_dmarc.<domain>` TXT record.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub version: String,
    pub policy: Option<Policy>,
    pub subdomain_policy: Option<Policy>,
    pub alignment_dkim: Alignment,
    pub alignment_spf: Alignment,
    pub aggregate_report_uris: Vec<String>,
    pub forensic_report_uris: Vec<String>,
    pub failure_options: Vec<FailureOption>,
    pub percent: u8,
    pub report_interval: u32,
}

impl Record {
    /// Parses a DMARC record. The `v=DMARC1` tag is mandatory; tags with
    /// invalid values reject the record.
    pub fn parse(record: &str) -> Result<Self> {
        let mut parsed = Record {
            percent: 100,
            ..Default::default()
        };

        for field in record.split(';') {
            let Some((tag, value)) = field.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match tag.trim() {
                "v" => {
                    if value != "DMARC1" {
                        return Err(Error::InvalidRecordType);
                    }
                    parsed.version = value.to_string();
                }
                "p" => parsed.policy = Some(Policy::parse(value)?),
                "sp" => parsed.subdomain_policy = Some(Policy::parse(value)?),
                "adkim" => parsed.alignment_dkim = parse_alignment(value)?,
                "aspf" => parsed.alignment_spf = parse_alignment(value)?,
                "rua" => {
                    parsed.aggregate_report_uris =
                        value.split(',').map(|uri| uri.trim().to_string()).collect();
                }
                "ruf" => {
                    parsed.forensic_report_uris =
                        value.split(',').map(|uri| uri.trim().to_string()).collect();
                }
                "fo" => {
                    for option in value.split(':') {
                        parsed.failure_options.push(match option.trim() {
                            "0" => FailureOption::AllFail,
                            "1" => FailureOption::AnyFail,
                            "d" => FailureOption::DkimOnly,
                            "s" => FailureOption::SpfOnly,
                            _ => return Err(Error::InvalidRecordType),
                        });
                    }
                }
                "pct" => {
                    let pct: u8 = value.parse().map_err(|_| Error::InvalidRecordType)?;
                    if pct > 100 {
                        return Err(Error::InvalidRecordType);
                    }
                    parsed.percent = pct;
                }
                "ri" => {
                    parsed.report_interval =
                        value.parse().map_err(|_| Error::InvalidRecordType)?;
                }
                _ => {}
            }
        }

        if parsed.version.is_empty() {
            return Err(Error::InvalidRecordType);
        }

        Ok(parsed)
    }

    /// Fetches and parses the record published at `_dmarc.<domain>`. The
    /// first record carrying a policy wins; the organizational-domain
    /// fallback for unlisted subdomains is left to the caller.
    pub async fn lookup(domain: &str, resolver: &Resolver) -> Result<Self> {
        let name = format!("_dmarc.{}.", domain);
        for record in resolver.txt_lookup(&name).await? {
            let parsed = Record::parse(&record)?;
            if parsed.policy.is_some() {
                return Ok(parsed);
            }
        }
        Err(Error::DnsRecordNotFound)
    }

    /// The policy applied to mail from a subdomain: `sp=` when published,
    /// otherwise `p=`.
    pub fn effective_subdomain_policy(&self) -> Option<Policy> {
        self.subdomain_policy.or(self.policy)
    }
}

fn parse_alignment(value: &str) -> Result<Alignment> {
    match value {
        "r" => Ok(Alignment::Relaxed),
        "s" => Ok(Alignment::Strict),
        _ => Err(Error::InvalidRecordType),
    }
}
