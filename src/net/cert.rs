//! Certificate authenticity checks beyond chain validation.
//!
//! # Responsibilities
//! - Require a minimum chain length
//! - Match the intermediate CA's public key against a pin list
//! - Match the leaf issuer common name against an expected prefix
//!
//! # Design Decisions
//! - Pins are base64 SHA-256 digests of the DER SubjectPublicKeyInfo,
//!   optionally written with a `sha256/` prefix
//! - Every mismatch is a trust error; the IP is never retried

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::config::TlsConfig;
use crate::error::CertificateTrustError;

const PIN_PREFIX: &str = "sha256/";

/// Decode a configured pin into its raw digest.
pub fn decode_pin(pin: &str) -> Option<[u8; 32]> {
    let encoded = pin.trim();
    let encoded = encoded.strip_prefix(PIN_PREFIX).unwrap_or(encoded);
    let bytes = STANDARD.decode(encoded).ok()?;
    bytes.try_into().ok()
}

/// SHA-256 of the certificate's SubjectPublicKeyInfo, base64 encoded.
pub fn spki_pin(der: &[u8]) -> Result<String, CertificateTrustError> {
    let cert = parse(der)?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(STANDARD.encode(digest))
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, CertificateTrustError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| CertificateTrustError::Malformed(e.to_string()))
}

/// Checks a validated peer chain for signs of interception.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    min_chain_len: usize,
    pins: HashSet<[u8; 32]>,
    issuer_prefix: String,
}

impl CertificateVerifier {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            min_chain_len: config.min_chain_len,
            pins: config
                .pinned_intermediates
                .iter()
                .filter_map(|p| decode_pin(p))
                .collect(),
            issuer_prefix: config.issuer_prefix.clone(),
        }
    }

    /// Accepts any chain.
    pub fn permissive() -> Self {
        Self {
            min_chain_len: 0,
            pins: HashSet::new(),
            issuer_prefix: String::new(),
        }
    }

    pub fn verify(&self, chain: &[CertificateDer<'_>]) -> Result<(), CertificateTrustError> {
        if chain.len() < self.min_chain_len {
            return Err(CertificateTrustError::ChainTooShort {
                len: chain.len(),
                min: self.min_chain_len,
            });
        }

        if !self.pins.is_empty() {
            let intermediate = chain.get(1).ok_or(CertificateTrustError::ChainTooShort {
                len: chain.len(),
                min: 2,
            })?;
            let cert = parse(intermediate.as_ref())?;
            let digest: [u8; 32] = Sha256::digest(cert.public_key().raw).into();
            if !self.pins.contains(&digest) {
                return Err(CertificateTrustError::PinMismatch {
                    fingerprint: STANDARD.encode(digest),
                });
            }
        }

        if !self.issuer_prefix.is_empty() {
            let leaf = chain.first().ok_or(CertificateTrustError::ChainTooShort {
                len: 0,
                min: 1,
            })?;
            let cert = parse(leaf.as_ref())?;
            let issuer = cert
                .issuer()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string();
            if !issuer.starts_with(&self.issuer_prefix) {
                return Err(CertificateTrustError::UnexpectedIssuer {
                    issuer,
                    expected: self.issuer_prefix.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};

    struct Chain {
        ders: Vec<CertificateDer<'static>>,
        intermediate_pin: String,
    }

    fn ca_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
    }

    fn chain(intermediate_cn: &str) -> Chain {
        let root_key = KeyPair::generate().unwrap();
        let root_params = ca_params("Test Root CA");
        let root = root_params.self_signed(&root_key).unwrap();
        let root_issuer = Issuer::new(root_params, root_key);

        let inter_key = KeyPair::generate().unwrap();
        let inter_params = ca_params(intermediate_cn);
        let inter = inter_params.signed_by(&inter_key, &root_issuer).unwrap();
        let inter_issuer = Issuer::new(inter_params, inter_key);

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec!["www.google.com".to_string()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &inter_issuer).unwrap();

        let intermediate_pin = spki_pin(inter.der()).unwrap();
        Chain {
            ders: vec![leaf.der().clone(), inter.der().clone(), root.der().clone()],
            intermediate_pin,
        }
    }

    fn config(pins: Vec<String>) -> TlsConfig {
        TlsConfig {
            pinned_intermediates: pins,
            ..TlsConfig::default()
        }
    }

    #[test]
    fn decode_pin_accepts_prefix() {
        let raw = STANDARD.encode([7u8; 32]);
        assert_eq!(decode_pin(&raw), Some([7u8; 32]));
        assert_eq!(decode_pin(&format!("sha256/{raw}")), Some([7u8; 32]));
        assert_eq!(decode_pin("not base64!"), None);
        assert_eq!(decode_pin(&STANDARD.encode([1u8; 16])), None);
    }

    #[test]
    fn genuine_chain_passes() {
        let chain = chain("Google Internet Authority G3");
        let verifier = CertificateVerifier::new(&config(vec![chain.intermediate_pin.clone()]));
        assert!(verifier.verify(&chain.ders).is_ok());
    }

    #[test]
    fn short_chain_is_rejected() {
        let chain = chain("Google Internet Authority G3");
        let verifier = CertificateVerifier::new(&config(vec![]));
        assert_eq!(
            verifier.verify(&chain.ders[..2]),
            Err(CertificateTrustError::ChainTooShort { len: 2, min: 3 })
        );
    }

    #[test]
    fn unpinned_intermediate_is_rejected() {
        let chain = chain("Google Internet Authority G3");
        let other = STANDARD.encode([9u8; 32]);
        let verifier = CertificateVerifier::new(&config(vec![other]));
        assert!(matches!(
            verifier.verify(&chain.ders),
            Err(CertificateTrustError::PinMismatch { .. })
        ));
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let chain = chain("Corporate Inspection CA");
        let verifier = CertificateVerifier::new(&config(vec![]));
        match verifier.verify(&chain.ders) {
            Err(CertificateTrustError::UnexpectedIssuer { issuer, .. }) => {
                assert_eq!(issuer, "Corporate Inspection CA");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn permissive_accepts_anything() {
        let chain = chain("Corporate Inspection CA");
        assert!(CertificateVerifier::permissive().verify(&chain.ders[..1]).is_ok());
    }
}
