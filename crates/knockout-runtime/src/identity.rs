//! Identity gate backed by a credentials file.
//!
//! The file is a JSON object mapping opaque tokens to identities:
//!
//! ```json
//! { "tok-alice": { "id": "u-1", "name": "Alice" } }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use knockout_core::{ConfigError, CredentialVerifier, Identity, IdentityId, KnockoutError, NameDirectory};

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    name: String,
}

#[derive(Debug, Default)]
pub struct TokenFileVerifier {
    tokens: HashMap<String, Identity>,
    names: HashMap<IdentityId, String>,
}

impl TokenFileVerifier {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let entries: HashMap<String, Entry> =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(format!("credentials: {e}")))?;
        let mut verifier = Self::default();
        for (token, entry) in entries {
            if token.is_empty() || entry.id.is_empty() {
                return Err(ConfigError::Invalid(
                    "credentials: empty token or identity id".into(),
                ));
            }
            let id = IdentityId::new(entry.id);
            verifier.names.insert(id.clone(), entry.name.clone());
            verifier.tokens.insert(
                token,
                Identity {
                    id,
                    display_name: entry.name,
                },
            );
        }
        Ok(verifier)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CredentialVerifier for TokenFileVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, KnockoutError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| KnockoutError::AuthenticationFailure("unknown credential".into()))
    }
}

impl NameDirectory for TokenFileVerifier {
    fn resolve_display_name(&self, identity: &IdentityId) -> Option<String> {
        self.names.get(identity).cloned()
    }
}

/// Pull the credential out of a WebSocket upgrade request:
/// `Authorization: Bearer <token>` first, then a `token` query parameter.
pub fn credential_from_request(headers: &http::HeaderMap, uri: &http::Uri) -> Option<String> {
    let bearer = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "tok-alice": { "id": "u-1", "name": "Alice" },
        "tok-bob":   { "id": "u-2", "name": "Bob" }
    }"#;

    #[test]
    fn verifies_known_tokens() {
        let v = TokenFileVerifier::from_json(FILE).unwrap();
        assert_eq!(v.len(), 2);
        let alice = v.verify("tok-alice").unwrap();
        assert_eq!(alice.id, IdentityId::new("u-1"));
        assert_eq!(alice.display_name, "Alice");
    }

    #[test]
    fn rejects_unknown_token() {
        let v = TokenFileVerifier::from_json(FILE).unwrap();
        assert!(matches!(
            v.verify("tok-mallory"),
            Err(KnockoutError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn resolves_names_with_fallback() {
        let v = TokenFileVerifier::from_json(FILE).unwrap();
        assert_eq!(v.display_name_or_id(&IdentityId::new("u-2")), "Bob");
        assert_eq!(v.display_name_or_id(&IdentityId::new("u-9")), "u-9");
    }

    #[test]
    fn rejects_malformed_file() {
        assert!(matches!(
            TokenFileVerifier::from_json("[1, 2]"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TokenFileVerifier::from_json(r#"{"": {"id": "u", "name": "n"}}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn credential_from_bearer_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer tok-alice".parse().unwrap());
        let uri: http::Uri = "/?token=other".parse().unwrap();
        assert_eq!(credential_from_request(&headers, &uri).as_deref(), Some("tok-alice"));
    }

    #[test]
    fn credential_from_query() {
        let headers = http::HeaderMap::new();
        let uri: http::Uri = "/play?room=x&token=tok-bob".parse().unwrap();
        assert_eq!(credential_from_request(&headers, &uri).as_deref(), Some("tok-bob"));

        let uri: http::Uri = "/play?token=".parse().unwrap();
        assert_eq!(credential_from_request(&headers, &uri), None);
        let uri: http::Uri = "/".parse().unwrap();
        assert_eq!(credential_from_request(&headers, &uri), None);
    }
}
