//! Decides what a configuration change means for the installed certificate.
//! Pure and synchronous; the orchestrator executes the decision.

use crate::keystore::CertificateRecord;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The installed certificate still matches the configuration
    NoOp,
    /// A new certificate is needed
    Renew,
    /// A new certificate is needed and the old one belongs to a different
    /// directory, so it should also be revoked there
    RenewAndRevoke,
}

/// Compares the desired identity from the configuration against the
/// currently installed record.
///
/// The comparison is deliberately narrow: the common name is matched
/// case-sensitively by value, added domains force a renewal, but removing a
/// non-CN domain or rewording non-CN RDNs leaves a still-valid certificate
/// alone.
pub fn reconcile(
    directory_uri: &Url,
    common_name: &str,
    domains: &[String],
    current: Option<&CertificateRecord>,
) -> ReconcileAction {
    let Some(record) = current else {
        return ReconcileAction::Renew;
    };
    // Unknown provenance (restored without history) cannot prove a directory
    // change, so it never triggers a revocation on its own.
    if let Some(record_directory) = &record.directory_uri
        && record_directory != directory_uri
    {
        return ReconcileAction::RenewAndRevoke;
    }
    if record.subject_common_name() != Some(common_name) {
        return ReconcileAction::Renew;
    }
    let covered = &record.domains;
    if domains.iter().any(|domain| !covered.contains(domain)) {
        return ReconcileAction::Renew;
    }
    ReconcileAction::NoOp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_helper::self_signed;

    fn record(directory: Option<&str>, domains: &[&str], cn: Option<&str>) -> CertificateRecord {
        let (leaf, pem) = self_signed(domains, cn);
        CertificateRecord {
            chain: vec![leaf],
            pem,
            directory_uri: directory.map(|d| Url::parse(d).unwrap()),
            domains: domains.iter().map(ToString::to_string).collect(),
        }
    }

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    const DIR_A: &str = "https://ca-a.example/acme/directory";
    const DIR_B: &str = "https://ca-b.example/acme/directory";

    #[test]
    fn test_no_certificate_renews() {
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "example.com",
            &domains(&["example.com"]),
            None,
        );
        assert_eq!(action, ReconcileAction::Renew);
    }

    #[test]
    fn test_unchanged_identity_is_noop() {
        let record = record(Some(DIR_A), &["example.com", "www.example.com"], Some("example.com"));
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "example.com",
            &domains(&["example.com", "www.example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::NoOp);
    }

    #[test]
    fn test_directory_change_renews_and_revokes() {
        let record = record(Some(DIR_A), &["example.com"], Some("example.com"));
        let action = reconcile(
            &Url::parse(DIR_B).unwrap(),
            "example.com",
            &domains(&["example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::RenewAndRevoke);
    }

    #[test]
    fn test_cn_change_renews() {
        let record = record(Some(DIR_A), &["old.example", "other.example"], Some("old.example"));
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "other.example",
            &domains(&["other.example"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::Renew);
    }

    #[test]
    fn test_cn_comparison_is_case_sensitive() {
        let record = record(Some(DIR_A), &["Example.com"], Some("Example.com"));
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "example.com",
            &domains(&["example.com", "Example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::Renew);
    }

    #[test]
    fn test_added_domain_renews() {
        let record = record(Some(DIR_A), &["example.com"], Some("example.com"));
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "example.com",
            &domains(&["example.com", "new.example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::Renew);
    }

    #[test]
    fn test_removed_non_cn_domain_is_noop() {
        let record = record(
            Some(DIR_A),
            &["example.com", "decommissioned.example.com"],
            Some("example.com"),
        );
        let action = reconcile(
            &Url::parse(DIR_A).unwrap(),
            "example.com",
            &domains(&["example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::NoOp);
    }

    #[test]
    fn test_unknown_provenance_does_not_revoke() {
        let record = record(None, &["example.com"], Some("example.com"));
        let action = reconcile(
            &Url::parse(DIR_B).unwrap(),
            "example.com",
            &domains(&["example.com"]),
            Some(&record),
        );
        assert_eq!(action, ReconcileAction::NoOp);
    }
}
