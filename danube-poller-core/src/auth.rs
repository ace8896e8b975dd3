//! Request headers derived from a source's auth descriptor.

use crate::config::AuthConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::warn;

/// Build auth headers for `auth`.
///
/// Unknown descriptors produce no headers and a warning.
pub fn auth_headers(auth: Option<&AuthConfig>, source_name: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    match auth {
        None => {}
        Some(AuthConfig::Bearer { token }) => {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        Some(AuthConfig::ApiKey { key, header }) => {
            headers.insert(header.clone(), key.clone());
        }
        Some(AuthConfig::Basic { username, password }) => {
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
        }
        Some(AuthConfig::Unknown) => {
            warn!(
                source = %source_name,
                "Unknown auth kind, sending requests without credentials"
            );
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer() {
        let headers = auth_headers(
            Some(&AuthConfig::Bearer {
                token: "abc".into(),
            }),
            "crm",
        );
        assert_eq!(headers["Authorization"], "Bearer abc");
    }

    #[test]
    fn test_api_key_uses_configured_header() {
        let headers = auth_headers(
            Some(&AuthConfig::ApiKey {
                key: "k1".into(),
                header: "X-Token".into(),
            }),
            "crm",
        );
        assert_eq!(headers["X-Token"], "k1");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_basic() {
        let headers = auth_headers(
            Some(&AuthConfig::Basic {
                username: "user".into(),
                password: "pass".into(),
            }),
            "crm",
        );
        assert_eq!(headers["Authorization"], "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_unknown_and_missing() {
        assert!(auth_headers(Some(&AuthConfig::Unknown), "crm").is_empty());
        assert!(auth_headers(None, "crm").is_empty());
    }
}
