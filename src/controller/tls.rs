//! Cluster TLS policy mirror
//!
//! The APIServer config object carries the cluster-wide TLS profile. Its
//! resolved cipher list and minimum version are mirrored into the process
//! environment for the metrics endpoint and the provisioner workloads.

use crate::crd::{APIServer, TlsSecurityProfile};
use tracing::info;

pub const TLS_CIPHERS_ENV: &str = "TLS_CIPHERS";
pub const TLS_MIN_VERSION_ENV: &str = "TLS_MIN_VERSION";

const MODERN_CIPHERS: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
];

const INTERMEDIATE_CIPHERS: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-CHACHA20-POLY1305",
    "ECDHE-RSA-CHACHA20-POLY1305",
    "DHE-RSA-AES128-GCM-SHA256",
    "DHE-RSA-AES256-GCM-SHA384",
];

const OLD_EXTRA_CIPHERS: &[&str] = &[
    "DHE-RSA-CHACHA20-POLY1305",
    "ECDHE-ECDSA-AES128-SHA256",
    "ECDHE-RSA-AES128-SHA256",
    "ECDHE-ECDSA-AES128-SHA",
    "ECDHE-RSA-AES128-SHA",
    "ECDHE-ECDSA-AES256-SHA384",
    "ECDHE-RSA-AES256-SHA384",
    "ECDHE-ECDSA-AES256-SHA",
    "ECDHE-RSA-AES256-SHA",
    "DHE-RSA-AES128-SHA256",
    "DHE-RSA-AES256-SHA256",
    "AES128-GCM-SHA256",
    "AES256-GCM-SHA384",
    "AES128-SHA256",
    "AES256-SHA256",
    "AES128-SHA",
    "AES256-SHA",
    "DES-CBC3-SHA",
];

/// Resolved TLS settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub ciphers: Vec<String>,
    pub min_version: String,
}

fn policy(ciphers: &[&str], min_version: &str) -> TlsPolicy {
    TlsPolicy {
        ciphers: ciphers.iter().map(|c| c.to_string()).collect(),
        min_version: min_version.to_string(),
    }
}

/// Resolve a profile; a missing or unknown profile means Intermediate
pub fn select(profile: Option<&TlsSecurityProfile>) -> TlsPolicy {
    let type_ = profile.and_then(|p| p.type_.as_deref()).unwrap_or("Intermediate");
    match type_ {
        "Old" => {
            let ciphers: Vec<&str> = INTERMEDIATE_CIPHERS
                .iter()
                .chain(OLD_EXTRA_CIPHERS)
                .copied()
                .collect();
            policy(&ciphers, "VersionTLS10")
        }
        "Modern" => policy(MODERN_CIPHERS, "VersionTLS13"),
        "Custom" => match profile.and_then(|p| p.custom.as_ref()) {
            Some(custom) => TlsPolicy {
                ciphers: custom.ciphers.clone(),
                min_version: custom
                    .min_tls_version
                    .clone()
                    .unwrap_or_else(|| "VersionTLS12".to_string()),
            },
            None => policy(INTERMEDIATE_CIPHERS, "VersionTLS12"),
        },
        _ => policy(INTERMEDIATE_CIPHERS, "VersionTLS12"),
    }
}

/// Write the policy of `api_server` into the process environment
pub fn mirror(api_server: &APIServer) {
    let resolved = select(api_server.spec.tls_security_profile.as_ref());
    std::env::set_var(TLS_CIPHERS_ENV, resolved.ciphers.join(","));
    std::env::set_var(TLS_MIN_VERSION_ENV, &resolved.min_version);
    info!(
        min_version = %resolved.min_version,
        ciphers = resolved.ciphers.len(),
        "Mirrored cluster TLS policy"
    );
}
