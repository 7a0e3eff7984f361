//! NIP-05 `name@domain` identifiers.

use std::collections::HashMap;

use serde::Deserialize;
use url::Url;

use crate::Error;

#[derive(Debug, Deserialize)]
struct NostrJson {
    #[serde(default)]
    names: HashMap<String, String>,
}

/// The well-known URL for an identifier, plus the local part to look up.
pub fn well_known_url(identifier: &str) -> Option<(Url, String)> {
    let (local, domain) = match identifier.trim().split_once('@') {
        Some((local, domain)) => (local.to_lowercase(), domain.to_lowercase()),
        // A bare domain means the root identifier.
        None => ("_".to_string(), identifier.trim().to_lowercase()),
    };
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    let mut url = Url::parse(&format!("https://{domain}/.well-known/nostr.json")).ok()?;
    url.query_pairs_mut().append_pair("name", &local);
    Some((url, local))
}

#[derive(Clone, Default)]
pub struct Nip05Client {
    http: reqwest::Client,
}

impl Nip05Client {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Resolves an identifier to the hex key its domain publishes for it.
    pub async fn lookup(&self, identifier: &str) -> Result<Option<String>, Error> {
        let Some((url, local)) = well_known_url(identifier) else {
            return Ok(None);
        };
        let document = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<NostrJson>()
            .await?;
        Ok(document.names.get(&local).map(|key| key.to_lowercase()))
    }

    pub async fn verify(&self, identifier: &str, pubkey: &str) -> Result<bool, Error> {
        Ok(self
            .lookup(identifier)
            .await?
            .is_some_and(|key| key == pubkey.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_url() {
        let (url, local) = well_known_url("Bob@Example.com").unwrap();
        assert_eq!(url.as_str(), "https://example.com/.well-known/nostr.json?name=bob");
        assert_eq!(local, "bob");

        let (url, local) = well_known_url("example.com").unwrap();
        assert_eq!(url.as_str(), "https://example.com/.well-known/nostr.json?name=_");
        assert_eq!(local, "_");

        assert!(well_known_url("@example.com").is_none());
        assert!(well_known_url("bob@").is_none());
    }

    #[test]
    fn test_document_parsing() {
        let document: NostrJson = serde_json::from_str(
            r#"{"names":{"bob":"ABCDEF"},"relays":{"abcdef":["wss://relay.one"]}}"#,
        )
        .unwrap();
        assert_eq!(document.names.get("bob").map(String::as_str), Some("ABCDEF"));
    }
}
