use crate::cert::{ParsedX509Certificate, load_certificates_from_memory};
use anyhow::{Context, bail};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// One issued certificate with its chain and provenance. Records are
/// superseded by installing a new one, never mutated.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub chain: Vec<ParsedX509Certificate>,
    pub pem: String,
    pub directory_uri: Option<Url>,
    pub domains: Vec<String>,
}

impl CertificateRecord {
    pub fn leaf(&self) -> &ParsedX509Certificate {
        &self.chain[0]
    }

    pub fn subject_common_name(&self) -> Option<&str> {
        self.leaf().subject_common_name.as_deref()
    }
}

/// Holds the single active certificate. Readers get a consistent
/// `Arc<CertificateRecord>` snapshot; installs swap the whole record at once.
#[derive(Debug)]
pub struct Keystore {
    chain_path: PathBuf,
    active: RwLock<Option<Arc<CertificateRecord>>>,
}

impl Keystore {
    pub fn new<P: AsRef<Path>>(chain_path: P) -> Self {
        Self {
            chain_path: chain_path.as_ref().to_path_buf(),
            active: RwLock::new(None),
        }
    }

    pub fn active(&self) -> Option<Arc<CertificateRecord>> {
        self.active.read().clone()
    }

    /// Restores the record from the chain file on disk, if one exists.
    /// `directory_uri` is the provenance recorded in the history file; the
    /// PEM itself does not carry it. Returns whether a record was restored.
    pub fn restore(&self, directory_uri: Option<Url>) -> anyhow::Result<bool> {
        let pem = match std::fs::read_to_string(&self.chain_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).context(format!(
                    "Reading certificate chain {} failed",
                    self.chain_path.display()
                ));
            }
        };
        let chain = load_certificates_from_memory(&pem, None)?;
        if chain.is_empty() {
            bail!(
                "Certificate chain file {} contains no certificates",
                self.chain_path.display()
            );
        }
        let domains = chain[0]
            .subject_alternative_names
            .iter()
            .map(ToString::to_string)
            .collect();
        let record = Arc::new(CertificateRecord {
            chain,
            pem,
            directory_uri,
            domains,
        });
        debug!(
            "Restored certificate with serial {} from {}",
            record.leaf().serial,
            self.chain_path.display()
        );
        *self.active.write() = Some(record);
        Ok(true)
    }

    /// Parses `pem`, persists it to the chain file and atomically swaps the
    /// active record. The old record stays valid for readers still holding it.
    pub fn install(
        &self,
        pem: String,
        directory_uri: Url,
        domains: Vec<String>,
    ) -> anyhow::Result<Arc<CertificateRecord>> {
        let chain = load_certificates_from_memory(&pem, None)
            .context("Parsing downloaded certificate chain failed")?;
        if chain.is_empty() {
            bail!("CA returned an empty certificate chain");
        }
        if let Some(parent) = self.chain_path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "Creating directory {} for the certificate chain failed",
                parent.display()
            ))?;
        }
        std::fs::write(&self.chain_path, &pem).context(format!(
            "Writing certificate chain {} failed",
            self.chain_path.display()
        ))?;
        let record = Arc::new(CertificateRecord {
            chain,
            pem,
            directory_uri: Some(directory_uri),
            domains,
        });
        info!(
            "Installed certificate with serial {}, expires {}",
            record.leaf().serial,
            record.leaf().validity.not_after
        );
        *self.active.write() = Some(record.clone());
        Ok(record)
    }
}
