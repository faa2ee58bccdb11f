//! Subject distinguished name templates, e.g. `cn=example.com,o=Acme,c=US`.
//! The common name must come first and decides which domain the certificate
//! is anchored to; the remaining RDNs are passed through to the CSR.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnError {
    #[error("'{0}' is not a distinguished name")]
    NotADistinguishedName(String),
    #[error("the common name (cn) must be the first RDN in '{0}'")]
    CommonNameNotFirst(String),
    #[error("unknown RDN type '{0}'")]
    UnknownRdnType(String),
    #[error("RDN '{0}' has an empty value")]
    EmptyValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdnType {
    Cn,
    C,
    St,
    L,
    O,
    Ou,
    Street,
    Dc,
}

impl RdnType {
    fn as_str(self) -> &'static str {
        match self {
            RdnType::Cn => "cn",
            RdnType::C => "c",
            RdnType::St => "st",
            RdnType::L => "l",
            RdnType::O => "o",
            RdnType::Ou => "ou",
            RdnType::Street => "street",
            RdnType::Dc => "dc",
        }
    }
}

impl FromStr for RdnType {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "cn" => RdnType::Cn,
            "c" => RdnType::C,
            "st" => RdnType::St,
            "l" => RdnType::L,
            "o" => RdnType::O,
            "ou" => RdnType::Ou,
            "street" => RdnType::Street,
            "dc" => RdnType::Dc,
            other => return Err(DnError::UnknownRdnType(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    pub kind: RdnType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectDn {
    rdns: Vec<Rdn>,
}

impl SubjectDn {
    /// The default subject when no template is configured: `cn=<domain>`.
    pub fn default_for(domain: &str) -> Self {
        Self {
            rdns: vec![Rdn {
                kind: RdnType::Cn,
                value: domain.to_string(),
            }],
        }
    }

    /// The common name value. Guaranteed present, parsing enforces CN-first.
    pub fn common_name(&self) -> &str {
        &self.rdns[0].value
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }
}

impl FromStr for SubjectDn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rdns = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let Some((kind, value)) = part.split_once('=') else {
                return Err(DnError::NotADistinguishedName(s.to_string()));
            };
            let kind = kind.trim().parse::<RdnType>()?;
            let value = value.trim();
            if value.is_empty() {
                return Err(DnError::EmptyValue(part.to_string()));
            }
            rdns.push(Rdn {
                kind,
                value: value.to_string(),
            });
        }
        if rdns.is_empty() {
            return Err(DnError::NotADistinguishedName(s.to_string()));
        }
        if rdns[0].kind != RdnType::Cn {
            return Err(DnError::CommonNameNotFirst(s.to_string()));
        }
        Ok(Self { rdns })
    }
}

impl Display for SubjectDn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", rdn.kind.as_str(), rdn.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_simple_cn() {
        let dn: SubjectDn = "cn=example.com".parse().unwrap();
        assert_eq!(dn.common_name(), "example.com");
        assert_eq!(dn.rdns().len(), 1);
    }

    #[test]
    fn test_parse_full_dn() {
        let dn: SubjectDn = "CN=example.com, O=Acme Widgets, OU=IT, C=US".parse().unwrap();
        assert_eq!(dn.common_name(), "example.com");
        assert_eq!(dn.rdns().len(), 4);
        assert_eq!(dn.rdns()[1].kind, RdnType::O);
        assert_eq!(dn.rdns()[1].value, "Acme Widgets");
    }

    #[rstest]
    #[case::not_a_dn("example.com")]
    #[case::empty("")]
    fn test_parse_rejects_non_dn(#[case] input: &str) {
        assert!(matches!(
            input.parse::<SubjectDn>(),
            Err(DnError::NotADistinguishedName(_))
        ));
    }

    #[test]
    fn test_parse_rejects_cn_not_first() {
        assert!(matches!(
            "o=Acme,cn=example.com".parse::<SubjectDn>(),
            Err(DnError::CommonNameNotFirst(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_rdn_type() {
        assert!(matches!(
            "cn=example.com,x=what".parse::<SubjectDn>(),
            Err(DnError::UnknownRdnType(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_value() {
        assert!(matches!(
            "cn=".parse::<SubjectDn>(),
            Err(DnError::EmptyValue(_))
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let dn: SubjectDn = "CN=example.com , O=Acme".parse().unwrap();
        assert_eq!(dn.to_string(), "cn=example.com,o=Acme");
    }

    #[test]
    fn test_default_for_domain() {
        let dn = SubjectDn::default_for("first.example");
        assert_eq!(dn.common_name(), "first.example");
        assert_eq!(dn.to_string(), "cn=first.example");
    }
}
