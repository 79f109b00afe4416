/// Routing parameters carried inside proxy credentials
///
/// Clients steer a request by packing options into the credentials they
/// already send: `country=DE,session=abc` in an HTTP username, or
/// `secret_country-DE_session-abc` in a SOCKS5 password.

use relaymesh_common::normalize_country_code;
use std::collections::HashMap;

pub const COUNTRY: &str = "country";
pub const GROUP: &str = "group";
pub const SESSION: &str = "sessionId";

/// Parsed routing options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyParams {
    values: HashMap<String, String>,
}

impl ProxyParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Requested country, already normalized
    pub fn region(&self) -> Option<String> {
        self.values.get(COUNTRY).cloned()
    }

    fn insert(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            COUNTRY => {
                if let Some(code) = normalize_country_code(value) {
                    self.values.insert(COUNTRY.to_string(), code);
                }
            }
            k if k.contains("sess") => {
                self.values.insert(SESSION.to_string(), value.to_string());
            }
            _ => {
                self.values.insert(key, value.to_string());
            }
        }
    }

    /// A bare token: `resi*` selects the residential group, a country code
    /// selects a region unless one was already given
    fn insert_flag(&mut self, token: &str) {
        let lower = token.to_ascii_lowercase();
        if lower.contains("resi") {
            self.values.insert(GROUP.to_string(), "residential".to_string());
        }
        if !self.values.contains_key(COUNTRY) {
            if let Some(code) = normalize_country_code(token) {
                self.values.insert(COUNTRY.to_string(), code);
            }
        }
    }
}

/// Parse a comma separated list of `key=value` pairs and bare flags, as
/// found in an HTTP proxy username.
pub fn parse_params(input: &str) -> ProxyParams {
    let mut params = ProxyParams::default();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => {
                if !value.contains('=') {
                    params.insert(key, value);
                }
            }
            None => params.insert_flag(pair),
        }
    }
    params
}

/// Split a SOCKS5 password into the secret and its `_key-value` suffixes.
pub fn split_password(input: &str) -> (&str, ProxyParams) {
    let mut params = ProxyParams::default();
    let Some((secret, rest)) = input.split_once('_') else {
        return (input, params);
    };
    for pair in rest.split('_') {
        if let Some((key, value)) = pair.split_once('-') {
            params.insert(key, value);
        }
    }
    (secret, params)
}
