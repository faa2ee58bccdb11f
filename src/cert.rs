use crate::acme::object::Identifier;
use crate::crypto::keys::KeyPair;
use anyhow::{Context, Error};
use rcgen::CertificateSigningRequest;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::net::IpAddr;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::warn;
use x509_parser::extensions::{AccessDescription, GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// The maximum number of certificates we will parse in a PEM-array of certificates by default
const DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH: usize = 100;

/// id-ad-ocsp (1.3.6.1.5.5.7.48.1), as raw OID bytes
const OCSP_ACCESS_METHOD_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];

/// Builds and signs a CSR for the given identifiers. The subject DN carries
/// the common name if one is configured, and is empty otherwise (CAs take the
/// identifiers from the SAN extension anyway).
pub fn create_and_sign_csr(
    cert_key: &KeyPair,
    identifiers: Vec<Identifier>,
    common_name: Option<&str>,
) -> Result<CertificateSigningRequest, Error> {
    let rcgen_keypair = cert_key.to_rcgen_keypair()?;
    let mut cert_params = rcgen::CertificateParams::new(
        identifiers
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>(),
    )
    .context("CSR generation failed")?;
    let mut dn = rcgen::DistinguishedName::default();
    if let Some(cn) = common_name {
        dn.push(rcgen::DnType::CommonName, cn);
    }
    cert_params.distinguished_name = dn;
    let csr = cert_params
        .serialize_request(&rcgen_keypair)
        .context("Signing CSR failed")?;
    Ok(csr)
}

pub fn load_certificates_from_file<P: AsRef<Path>>(
    cert_file: P,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let cert_file = cert_file.as_ref();
    let cert_file_display = cert_file.display();
    let cert_file = File::open(cert_file).context(format!("Opening {cert_file_display} failed"))?;
    let reader = BufReader::new(cert_file);
    load_certificates_from_reader(reader, limit)
        .context(format!("Parsing certificate {cert_file_display} failed"))
}

pub fn load_certificates_from_memory<B: AsRef<[u8]>>(
    pem_bytes: B,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    load_certificates_from_reader(reader, limit)
}

fn load_certificates_from_reader<R: BufRead + Seek>(
    reader: R,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let mut certificates = Vec::new();
    for pem in
        Pem::iter_from_reader(reader).take(limit.unwrap_or(DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH))
    {
        let pem = pem.context("Reading PEM block failed")?;
        let parsed_x509 = ParsedX509Certificate::try_from(pem.contents)?;
        certificates.push(parsed_x509);
    }
    Ok(certificates)
}

/// Loads extra trust anchors for the HTTP client, e.g. a private test CA root.
pub async fn load_reqwest_certificates<I: Iterator<Item = T>, T: AsRef<Path>>(
    files: I,
) -> anyhow::Result<Vec<reqwest::Certificate>> {
    let mut certificates = Vec::with_capacity(files.size_hint().0);
    for cert_path in files {
        let cert_path = cert_path.as_ref();
        let cert_path_display = cert_path.display();
        let mut cert_file = tokio::fs::File::open(cert_path).await.context(format!(
            "Opening certificate file {cert_path_display} failed"
        ))?;
        let mut cert_data = Vec::new();
        cert_file
            .read_to_end(&mut cert_data)
            .await
            .context(format!(
                "Reading certificate file {cert_path_display} failed"
            ))?;
        let reqwest_cert = reqwest::Certificate::from_pem(&cert_data).context(format!(
            "Parsing certificate file PEM {cert_path_display} failed"
        ))?;
        certificates.push(reqwest_cert);
    }
    Ok(certificates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub subject_common_name: Option<String>,
    pub issuer: String,
    pub validity: Validity,
    pub subject_alternative_names: Vec<Identifier>,
    /// OCSP responder URIs from the Authority Information Access extension
    pub ocsp_responders: Vec<String>,
    /// DER encoding of the issuer name, hashed into the OCSP CertID
    pub raw_issuer_name: Vec<u8>,
    /// Raw subjectPublicKey BIT STRING contents; hashed into the OCSP CertID
    /// when this certificate is the issuer of the one being checked
    pub raw_public_key: Vec<u8>,
    /// Serial number exactly as encoded in the certificate
    pub raw_serial: Vec<u8>,
    pub raw_bytes: Vec<u8>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let serial = cert.serial.clone();
        let subject = cert.subject.to_string();
        let subject_common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(ToString::to_string);
        let issuer = cert.issuer.to_string();
        let validity = (&cert.validity).into();
        let raw_issuer_name = cert.tbs_certificate.issuer.as_raw().to_vec();
        let raw_public_key = cert
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .to_vec();
        let raw_serial = cert.raw_serial().to_vec();
        let mut subject_alternative_names = Vec::new();
        let mut ocsp_responders = Vec::new();
        for extension in cert.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    for AccessDescription {
                        access_method,
                        access_location,
                    } in &aia.accessdescs
                    {
                        if access_method.as_bytes() == OCSP_ACCESS_METHOD_OID
                            && let GeneralName::URI(uri) = access_location
                        {
                            ocsp_responders.push((*uri).to_string());
                        }
                    }
                }
                ParsedExtension::SubjectAlternativeName(san) => {
                    for general_name in &san.general_names {
                        match general_name {
                            GeneralName::DNSName(dns_name) => {
                                let id = Identifier::Dns {
                                    value: (*dns_name).to_string(),
                                };
                                subject_alternative_names.push(id);
                            }
                            GeneralName::IPAddress(ip_addr) => {
                                let ip_addr = *ip_addr;
                                let parsed_ip_addr = ip_addr
                                    .try_into()
                                    .ok()
                                    .map(|ipv6_addr: [u8; 16]| IpAddr::from(ipv6_addr))
                                    .or_else(|| {
                                        ip_addr
                                            .try_into()
                                            .ok()
                                            .map(|ipv4_addr: [u8; 4]| IpAddr::from(ipv4_addr))
                                    });
                                match parsed_ip_addr {
                                    Some(ip_addr) => {
                                        subject_alternative_names.push(ip_addr.into());
                                    }
                                    None => {
                                        warn!(
                                            "Certificate contains invalid IP address {ip_addr:#?}"
                                        );
                                    }
                                }
                            }
                            unsupported => {
                                warn!(
                                    "Found unsupported general name {unsupported} in certificate"
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(Self {
            serial,
            subject,
            subject_common_name,
            issuer,
            validity,
            subject_alternative_names,
            ocsp_responders,
            raw_issuer_name,
            raw_public_key,
            raw_serial,
            raw_bytes: der_bytes,
        })
    }
}

impl ParsedX509Certificate {
    pub fn as_der_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }

    /// A certificate is due for renewal once it is expired or inside the
    /// configured window before expiration.
    pub fn due_for_renewal(&self, renew_before_expiration: time::Duration) -> bool {
        self.validity.time_to_expiration() <= renew_before_expiration
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

impl Validity {
    pub fn time_to_expiration(&self) -> time::Duration {
        let now = time::OffsetDateTime::now_utc();
        self.not_after - now
    }

    pub fn total_lifetime(&self) -> time::Duration {
        self.not_after - self.not_before
    }
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}

#[cfg(test)]
pub mod test_helper {
    use super::ParsedX509Certificate;

    /// A freshly issued self-signed certificate plus its PEM, for tests that
    /// need realistic X.509 material without a CA.
    pub fn self_signed(domains: &[&str], cn: Option<&str>) -> (ParsedX509Certificate, String) {
        let mut params = rcgen::CertificateParams::new(
            domains.iter().map(ToString::to_string).collect::<Vec<_>>(),
        )
        .unwrap();
        let mut dn = rcgen::DistinguishedName::default();
        if let Some(cn) = cn {
            dn.push(rcgen::DnType::CommonName, cn);
        }
        params.distinguished_name = dn;
        let keypair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&keypair).unwrap();
        let pem = cert.pem();
        let parsed = super::load_certificates_from_memory(&pem, None)
            .unwrap()
            .remove(0);
        (parsed, pem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{Curve, KeyType};
    use std::str::FromStr;

    #[test]
    fn test_parse_self_signed() {
        let (parsed, _pem) =
            test_helper::self_signed(&["my.first.cert", "www.my.first.cert"], Some("my.first.cert"));
        assert_eq!(parsed.subject_common_name.as_deref(), Some("my.first.cert"));
        assert_eq!(
            parsed.subject_alternative_names,
            vec![
                Identifier::from_str("my.first.cert").unwrap(),
                Identifier::from_str("www.my.first.cert").unwrap(),
            ]
        );
        assert!(!parsed.raw_issuer_name.is_empty());
        assert!(!parsed.raw_public_key.is_empty());
        assert!(!parsed.raw_serial.is_empty());
        assert!(parsed.ocsp_responders.is_empty());
        assert!(parsed.validity.not_before < parsed.validity.not_after);
    }

    #[test]
    fn test_fresh_cert_is_not_due_for_renewal() {
        let (parsed, _pem) = test_helper::self_signed(&["example.com"], None);
        assert!(!parsed.due_for_renewal(time::Duration::days(7)));
        // A window longer than the total lifetime always renews
        let window = parsed.validity.total_lifetime() + time::Duration::days(1);
        assert!(parsed.due_for_renewal(window));
    }

    #[test]
    fn test_create_and_sign_csr_with_common_name() {
        let key = KeyPair::generate(KeyType::Ecdsa(Curve::P256)).unwrap();
        let csr = create_and_sign_csr(
            &key,
            vec![Identifier::from_str("example.com").unwrap()],
            Some("example.com"),
        )
        .unwrap();
        assert!(!csr.der().is_empty());
    }

    #[test]
    fn test_load_certificates_from_memory_respects_limit() {
        let (_, pem_one) = test_helper::self_signed(&["one.example"], None);
        let (_, pem_two) = test_helper::self_signed(&["two.example"], None);
        let combined = format!("{pem_one}{pem_two}");
        let certs = load_certificates_from_memory(&combined, Some(1)).unwrap();
        assert_eq!(certs.len(), 1);
        let certs = load_certificates_from_memory(&combined, None).unwrap();
        assert_eq!(certs.len(), 2);
    }
}
