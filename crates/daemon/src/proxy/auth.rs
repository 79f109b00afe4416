/// Credential checks for the proxy front ends

use relaymesh_common::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;

pub trait CredentialVerifier: Send + Sync {
    /// Whether `username`/`password` may use the proxy. `password` is the
    /// bare secret with any routing suffix already removed.
    fn verify(&self, username: &str, password: &str) -> bool;

    /// Whether clients without credentials are turned away
    fn requires_auth(&self) -> bool;
}

/// Accepts every client, with or without credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl CredentialVerifier for AllowAll {
    fn verify(&self, _username: &str, _password: &str) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        false
    }
}

/// Fixed username to password table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    fn requires_auth(&self) -> bool {
        true
    }
}

/// Verifier matching the server configuration
pub fn verifier_from_config(config: &ServerConfig) -> Arc<dyn CredentialVerifier> {
    if config.require_auth {
        Arc::new(StaticCredentials::new(config.users.clone()))
    } else {
        Arc::new(AllowAll)
    }
}
