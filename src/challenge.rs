use crate::acme::object::Token;
use crate::crypto::jws::JsonWebKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// RFC 8555 section 8.1: the key authorization served for an http-01
/// challenge is the token joined with the account key thumbprint.
pub fn key_authorization(account_key: &JsonWebKey, token: &Token) -> String {
    let thumbprint = account_key.acme_thumbprint();
    format!("{token}.{thumbprint}")
}

/// In-memory token map backing `/.well-known/acme-challenge/<token>`.
/// Tokens are provisioned just before challenge validation and removed right
/// after, so the map is almost always empty.
#[derive(Debug, Default, Clone)]
pub struct Http01Responder {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Responder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision(&self, token: &Token, authorization: String) {
        debug!("Provisioning http-01 response for token {token}");
        self.tokens.write().insert(token.to_string(), authorization);
    }

    pub fn remove(&self, token: &Token) {
        self.tokens.write().remove(token.as_str());
    }

    pub fn lookup(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}
