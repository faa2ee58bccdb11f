//! certkeeper keeps a single ACME-issued TLS certificate alive: it issues and
//! renews through RFC 8555, watches expiry and OCSP revocation status on a
//! schedule, reconciles configuration changes against the installed
//! certificate, and exposes a small REST control surface for operators.
//!
//! The library is embeddable; the `certkeeperd` binary wires it into a
//! standalone daemon.

pub mod acme;
pub mod cert;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod dn;
pub mod history;
pub mod keystore;
pub mod manager;
pub mod ocsp;
pub mod reconcile;
pub mod rest;
pub mod revocation;
pub mod scheduler;
pub mod time;

pub use config::AcmeConfig;
pub use manager::{CertManager, LifecycleError, RenewalTrigger};
