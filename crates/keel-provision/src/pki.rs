//! Certificates for the control-plane API
//!
//! When auth is enabled a fresh CA is generated per control-plane instance.
//! It signs the API server's serving certificate and the operator's client
//! certificate; only the client credential and the CA certificate are
//! persisted, in the instance's config record.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use keel_common::{Error, Result};

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for server and client certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn pki_error(msg: impl Into<String>) -> Error {
    Error::internal_with_context("pki", msg)
}

/// A CA certificate and its key, both PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// What a leaf certificate is for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateUsage {
    Server,
    Client,
}

/// Parameters for one leaf certificate
#[derive(Clone, Debug)]
pub struct CertificateRequest {
    pub common_name: String,
    /// DNS names or IP addresses
    pub sans: Vec<String>,
    pub usage: CertificateUsage,
}

impl CertificateRequest {
    pub fn server(common_name: impl Into<String>, sans: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            sans,
            usage: CertificateUsage::Server,
        }
    }

    pub fn client(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            sans: Vec::new(),
            usage: CertificateUsage::Client,
        }
    }
}

/// A signed leaf certificate, its key and the issuing CA, all PEM
#[derive(Clone)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

/// Certificate generation used by the provisioning saga
pub trait CertificateGenerator: Send + Sync {
    /// Create a new self-signed CA
    fn generate_ca(&self, common_name: &str) -> Result<CertificateAuthority>;

    /// Issue a leaf certificate signed by `ca`
    fn generate_certificate(
        &self,
        ca: &CertificateAuthority,
        request: &CertificateRequest,
    ) -> Result<CertificatePair>;
}

/// [`CertificateGenerator`] backed by rcgen
#[derive(Clone, Copy, Debug, Default)]
pub struct RcgenGenerator;

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("keel".to_string()),
    );
    dn
}

fn san_entries(sans: &[String]) -> Result<Vec<SanType>> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| pki_error(format!("invalid DNS name '{}': {}", san, e)))
            }
        })
        .collect()
}

impl CertificateGenerator for RcgenGenerator {
    fn generate_ca(&self, common_name: &str) -> Result<CertificateAuthority> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| pki_error(format!("failed to generate CA key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| pki_error(format!("failed to create CA cert: {}", e)))?;

        Ok(CertificateAuthority {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    fn generate_certificate(
        &self,
        ca: &CertificateAuthority,
        request: &CertificateRequest,
    ) -> Result<CertificatePair> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&request.common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![match request.usage {
            CertificateUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertificateUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = san_entries(&request.sans)?;

        let key = KeyPair::generate()
            .map_err(|e| pki_error(format!("failed to generate key: {}", e)))?;

        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| pki_error(format!("failed to parse CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| pki_error(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            pki_error(format!(
                "failed to sign certificate for {}: {}",
                request.common_name, e
            ))
        })?;

        Ok(CertificatePair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: ca.cert_pem.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_can_be_created() {
        let ca = RcgenGenerator.generate_ca("keel test CA").expect("CA");
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));
        assert!(!format!("{:?}", ca).contains("PRIVATE KEY"));
    }

    #[test]
    fn server_certificate_accepts_hosts_and_ips() {
        let ca = RcgenGenerator.generate_ca("keel test CA").expect("CA");
        let pair = RcgenGenerator
            .generate_certificate(
                &ca,
                &CertificateRequest::server(
                    "keel-api-server",
                    vec![
                        "localhost".to_string(),
                        "127.0.0.1".to_string(),
                        "a1b2.elb.us-east-1.amazonaws.com".to_string(),
                    ],
                ),
            )
            .expect("server cert");
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(pair.ca_pem, ca.cert_pem());
        assert_ne!(pair.key_pem, ca.key_pem());
    }

    #[test]
    fn client_certificate_is_signed_by_ca() {
        let ca = RcgenGenerator.generate_ca("keel test CA").expect("CA");
        let pair = RcgenGenerator
            .generate_certificate(&ca, &CertificateRequest::client("admin"))
            .expect("client cert");
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn invalid_dns_name_is_rejected() {
        let ca = RcgenGenerator.generate_ca("keel test CA").expect("CA");
        let result = RcgenGenerator.generate_certificate(
            &ca,
            &CertificateRequest::server("bad", vec!["bad name é".to_string()]),
        );
        assert!(result.is_err());
    }
}
