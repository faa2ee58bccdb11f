//! Minimal RFC 6960 OCSP codec: an unsigned request with a single SHA-1
//! CertID, and response parsing down to the first certStatus. Nothing in the
//! ecosystem we already depend on covers these structures, so the DER
//! handling lives here.

use crate::crypto::sha1;
use anyhow::{Context, bail, ensure};
use yasna::models::ObjectIdentifier;

/// id-pkix-ocsp-basic (1.3.6.1.5.5.7.48.1.1), raw OID contents
const ID_PKIX_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

const TAG_SEQUENCE: u8 = 0x30;
const TAG_ENUMERATED: u8 = 0x0a;
const TAG_OID: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_GENERALIZED_TIME: u8 = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

/// Builds an OCSPRequest for one certificate. The CertID hashes use SHA-1,
/// which every responder must support per RFC 6960 section 4.3.
pub fn build_request(
    issuer_name_der: &[u8],
    issuer_public_key: &[u8],
    raw_serial: &[u8],
) -> Vec<u8> {
    let issuer_name_hash = sha1(issuer_name_der);
    let issuer_key_hash = sha1(issuer_public_key);
    let sha1_oid = ObjectIdentifier::from_slice(&[1, 3, 14, 3, 2, 26]);

    yasna::construct_der(|writer| {
        // OCSPRequest > TBSRequest > requestList > Request > CertID
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer.next().write_sequence_of(|writer| {
                    writer.next().write_sequence(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer.next().write_sequence(|writer| {
                                writer.next().write_oid(&sha1_oid);
                                writer.next().write_null();
                            });
                            writer.next().write_bytes(&issuer_name_hash);
                            writer.next().write_bytes(&issuer_key_hash);
                            writer.next().write_bigint_bytes(raw_serial, true);
                        });
                    });
                });
            });
        });
    })
}

/// Parses an OCSPResponse and extracts the certStatus of the first (and for
/// our requests, only) SingleResponse. Signature verification is out of
/// scope; a forged "revoked" answer only triggers an early renewal.
pub fn parse_response(der: &[u8]) -> anyhow::Result<CertStatus> {
    let mut outer = DerReader::new(der);
    let body = outer
        .expect_element(TAG_SEQUENCE)
        .context("OCSPResponse is not a SEQUENCE")?;
    let mut response = DerReader::new(body);
    let status = response
        .expect_element(TAG_ENUMERATED)
        .context("missing responseStatus")?;
    ensure!(status.len() == 1, "malformed responseStatus");
    if status[0] != 0 {
        bail!("OCSP responder refused the request (status {})", status[0]);
    }
    let response_bytes = response
        .expect_element(0xa0)
        .context("successful response without responseBytes")?;
    let mut response_bytes = DerReader::new(response_bytes);
    let inner = response_bytes
        .expect_element(TAG_SEQUENCE)
        .context("malformed responseBytes")?;
    let mut inner = DerReader::new(inner);
    let response_type = inner
        .expect_element(TAG_OID)
        .context("missing responseType")?;
    ensure!(
        response_type == ID_PKIX_OCSP_BASIC,
        "unsupported OCSP response type"
    );
    let basic = inner
        .expect_element(TAG_OCTET_STRING)
        .context("missing response octets")?;
    parse_basic_response(basic)
}

fn parse_basic_response(der: &[u8]) -> anyhow::Result<CertStatus> {
    let mut outer = DerReader::new(der);
    let body = outer
        .expect_element(TAG_SEQUENCE)
        .context("BasicOCSPResponse is not a SEQUENCE")?;
    let mut basic = DerReader::new(body);
    let tbs = basic
        .expect_element(TAG_SEQUENCE)
        .context("missing tbsResponseData")?;
    let mut tbs = DerReader::new(tbs);
    let (mut tag, _) = tbs.read_element().context("empty tbsResponseData")?;
    if tag == 0xa0 {
        // explicit version, default omitted
        (tag, _) = tbs.read_element().context("missing responderID")?;
    }
    ensure!(tag == 0xa1 || tag == 0xa2, "malformed responderID");
    let _produced_at = tbs
        .expect_element(TAG_GENERALIZED_TIME)
        .context("missing producedAt")?;
    let responses = tbs
        .expect_element(TAG_SEQUENCE)
        .context("missing responses")?;
    let mut responses = DerReader::new(responses);
    let single = responses
        .expect_element(TAG_SEQUENCE)
        .context("response contains no SingleResponse")?;
    let mut single = DerReader::new(single);
    let _cert_id = single
        .expect_element(TAG_SEQUENCE)
        .context("missing CertID")?;
    let (status_tag, _) = single.read_element().context("missing certStatus")?;
    Ok(match status_tag {
        0x80 => CertStatus::Good,
        // RevokedInfo may appear primitive or constructed depending on encoder
        0x81 | 0xa1 => CertStatus::Revoked,
        0x82 => CertStatus::Unknown,
        other => bail!("unrecognized certStatus tag {other:#04x}"),
    })
}

/// Forward-only reader over one level of DER TLV elements.
struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_element(&mut self) -> anyhow::Result<(u8, &'a [u8])> {
        ensure!(self.pos < self.data.len(), "unexpected end of DER data");
        let tag = self.data[self.pos];
        let mut idx = self.pos + 1;
        ensure!(idx < self.data.len(), "truncated DER length");
        let first = self.data[idx];
        idx += 1;
        let length = if first < 0x80 {
            usize::from(first)
        } else {
            let num_octets = usize::from(first & 0x7f);
            ensure!(
                (1..=4).contains(&num_octets),
                "unsupported DER length encoding"
            );
            let mut length = 0usize;
            for _ in 0..num_octets {
                ensure!(idx < self.data.len(), "truncated DER length");
                length = (length << 8) | usize::from(self.data[idx]);
                idx += 1;
            }
            length
        };
        ensure!(
            idx.checked_add(length).is_some_and(|end| end <= self.data.len()),
            "DER element exceeds available data"
        );
        let value = &self.data[idx..idx + length];
        self.pos = idx + length;
        Ok((tag, value))
    }

    fn expect_element(&mut self, expected_tag: u8) -> anyhow::Result<&'a [u8]> {
        let (tag, value) = self.read_element()?;
        ensure!(
            tag == expected_tag,
            "expected DER tag {expected_tag:#04x}, found {tag:#04x}"
        );
        Ok(value)
    }
}


#[cfg(test)]
mod tests {
    use super::test_helper::{SynthStatus, synthesize_response};
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_build_request_embeds_hashes() {
        let request = build_request(b"issuer-name", b"issuer-key", &[0x01, 0x02]);
        let name_hash = sha1(b"issuer-name");
        let key_hash = sha1(b"issuer-key");
        assert_eq!(request[0], TAG_SEQUENCE);
        assert!(
            request
                .windows(name_hash.len())
                .any(|window| window == name_hash)
        );
        assert!(
            request
                .windows(key_hash.len())
                .any(|window| window == key_hash)
        );
    }

    #[rstest]
    #[case::good(SynthStatus::Good, CertStatus::Good)]
    #[case::revoked(SynthStatus::Revoked, CertStatus::Revoked)]
    #[case::unknown(SynthStatus::Unknown, CertStatus::Unknown)]
    fn test_parse_response(#[case] synth: SynthStatus, #[case] expected: CertStatus) {
        let der = synthesize_response(synth);
        let status = parse_response(&der).unwrap();
        assert_eq!(status, expected);
    }

    #[test]
    fn test_parse_response_rejects_error_status() {
        // responseStatus internalError(2), no responseBytes
        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_enum(2);
            });
        });
        let err = parse_response(&der).unwrap_err();
        assert!(err.to_string().contains("status 2"), "{err}");
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(parse_response(&[0x13, 0x37]).is_err());
        assert!(parse_response(&[]).is_err());
    }
}
