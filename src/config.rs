/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use cidr::IpCidr;
use serde::Deserialize;

use crate::common::canonical::Canonicalization;
use crate::common::crypto::{HashAlgorithm, PrivateKey};
use crate::{Error, Result};

/// Endpoint the MTA connects to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MilterListen {
    #[serde(rename = "Network", default)]
    pub network: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Mode", default)]
    pub mode: u32,
    #[serde(rename = "Owner", default)]
    pub owner: String,
    #[serde(rename = "Group", default)]
    pub group: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocketFile {
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Mode", default)]
    pub mode: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PidFile {
    #[serde(rename = "Path", default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "PIDFile", default)]
    pid_file: PidFile,
    #[serde(rename = "MilterListen", default)]
    milter_listen: MilterListen,
    #[serde(rename = "ControlSocketFile", default)]
    control_socket_file: SocketFile,
    #[serde(rename = "LogFile", default)]
    log_file: SocketFile,
    #[serde(rename = "MyNetworks", default)]
    my_networks: Vec<String>,
    #[serde(rename = "Domains", default)]
    domains: HashMap<String, RawDomain>,
    #[serde(rename = "User", default)]
    user: String,
    #[serde(rename = "Group", default)]
    group: String,
    #[serde(rename = "Debug", default)]
    debug: bool,
    #[serde(rename = "DKIMSignHeaders", default)]
    dkim_sign_headers: Vec<String>,
    #[serde(rename = "ARCSignHeaders", default)]
    arc_sign_headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDomain {
    #[serde(rename = "HeaderCanonicalization", default)]
    header_canonicalization: String,
    #[serde(rename = "BodyCanonicalization", default)]
    body_canonicalization: String,
    #[serde(rename = "HashAlgorithm", default)]
    hash_algorithm: String,
    #[serde(rename = "PrivateKeyFile", default)]
    private_key_file: String,
    #[serde(rename = "Selector", default)]
    selector: String,
    #[serde(rename = "ARCSelector", default)]
    arc_selector: String,
    #[serde(rename = "DKIM", default)]
    dkim: bool,
    #[serde(rename = "ARC", default)]
    arc: bool,
}

/// Per-domain signing policy with key material loaded.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub domain: String,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    pub hash_algorithm: HashAlgorithm,
    pub private_key: Arc<PrivateKey>,
    pub selector: String,
    pub arc_selector: String,
    pub dkim: bool,
    pub arc: bool,
}

/// Validated configuration. Read-only once built; a reload constructs a new
/// value and sessions keep the `Arc` they captured.
#[derive(Debug)]
pub struct Config {
    pub milter_listen: MilterListen,
    pub control_socket_file: SocketFile,
    pub log_file: SocketFile,
    pub pid_file: String,
    pub my_networks: Vec<IpCidr>,
    pub domains: HashMap<String, DomainConfig>,
    pub dkim_sign_headers: Vec<String>,
    pub arc_sign_headers: Vec<String>,
    pub user: String,
    pub group: String,
    pub debug: bool,
}

fn canonicalization_option(value: &str) -> Result<Canonicalization> {
    if value.is_empty() {
        return Ok(Canonicalization::Relaxed);
    }
    Canonicalization::parse(value)
        .map_err(|_| Error::Config(format!("invalid canonicalization: {}", value)))
}

impl Config {
    /// Loads and validates a YAML configuration file, reading every
    /// referenced private key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| Error::Config(format!("failed to read configuration: {}", err)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|err| Error::Config(format!("failed to parse configuration: {}", err)))?;

        match raw.milter_listen.network.as_str() {
            "tcp" | "unix" => {}
            network => {
                return Err(Error::Config(format!(
                    "invalid MilterListen.Network: {}",
                    network
                )));
            }
        }
        if raw.milter_listen.address.is_empty() {
            return Err(Error::Config("MilterListen.Address is not set".to_string()));
        }
        if raw.pid_file.path.is_empty() {
            return Err(Error::Config("PIDFile.Path is not set".to_string()));
        }
        if raw.control_socket_file.path.is_empty() {
            return Err(Error::Config(
                "ControlSocketFile.Path is not set".to_string(),
            ));
        }
        if raw.my_networks.is_empty() {
            return Err(Error::Config("MyNetworks is not set".to_string()));
        }
        if raw.domains.is_empty() {
            return Err(Error::Config("Domains is not set".to_string()));
        }
        if raw.dkim_sign_headers.is_empty() {
            return Err(Error::Config("DKIMSignHeaders is not set".to_string()));
        }
        if raw.arc_sign_headers.is_empty() {
            return Err(Error::Config("ARCSignHeaders is not set".to_string()));
        }

        let mut milter_listen = raw.milter_listen;
        if milter_listen.mode == 0 {
            milter_listen.mode = 0o600;
        }
        let mut control_socket_file = raw.control_socket_file;
        if control_socket_file.mode == 0 {
            control_socket_file.mode = 0o600;
        }
        let mut log_file = raw.log_file;
        if log_file.mode == 0 {
            log_file.mode = 0o600;
        }

        let mut my_networks = Vec::with_capacity(raw.my_networks.len());
        for network in &raw.my_networks {
            my_networks.push(
                network
                    .parse::<IpCidr>()
                    .map_err(|err| Error::Config(format!("invalid network {}: {}", network, err)))?,
            );
        }

        let mut domains = HashMap::with_capacity(raw.domains.len());
        for (name, domain) in raw.domains {
            let pem = std::fs::read_to_string(&domain.private_key_file).map_err(|err| {
                Error::Config(format!(
                    "failed to read key {}: {}",
                    domain.private_key_file, err
                ))
            })?;
            let private_key = PrivateKey::from_pem(&pem).map_err(|err| {
                Error::Config(format!(
                    "failed to parse key {}: {}",
                    domain.private_key_file, err
                ))
            })?;

            let hash_algorithm = if domain.hash_algorithm.is_empty() {
                HashAlgorithm::Sha256
            } else {
                HashAlgorithm::parse(&domain.hash_algorithm).map_err(|_| {
                    Error::Config(format!("invalid HashAlgorithm: {}", domain.hash_algorithm))
                })?
            };

            let arc_selector = if domain.arc_selector.is_empty() {
                domain.selector.clone()
            } else {
                domain.arc_selector
            };

            domains.insert(
                name.clone(),
                DomainConfig {
                    domain: name,
                    header_canonicalization: canonicalization_option(
                        &domain.header_canonicalization,
                    )?,
                    body_canonicalization: canonicalization_option(
                        &domain.body_canonicalization,
                    )?,
                    hash_algorithm,
                    private_key: Arc::new(private_key),
                    selector: domain.selector,
                    arc_selector,
                    dkim: domain.dkim,
                    arc: domain.arc,
                },
            );
        }

        Ok(Config {
            milter_listen,
            control_socket_file,
            log_file,
            pid_file: raw.pid_file.path,
            my_networks,
            domains,
            dkim_sign_headers: raw.dkim_sign_headers,
            arc_sign_headers: raw.arc_sign_headers,
            user: raw.user,
            group: raw.group,
            debug: raw.debug,
        })
    }

    /// True when the address falls inside one of the configured internal
    /// networks.
    pub fn is_my_network(&self, addr: IpAddr) -> bool {
        self.my_networks.iter().any(|network| network.contains(&addr))
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.get(name)
    }
}
