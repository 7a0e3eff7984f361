//! NIP-11 relay information documents.

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

pub const NOSTR_JSON_MIME: &str = "application/nostr+json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
    #[serde(default)]
    pub software: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Maps `wss://host/path` to `https://host/path` (and `ws` to `http`).
pub fn metadata_url(relay_url: &str) -> Result<Url, Error> {
    let mut url = Url::parse(relay_url).map_err(|_| Error::InvalidRelayUrl(relay_url.to_string()))?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        _ => return Err(Error::InvalidRelayUrl(relay_url.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidRelayUrl(relay_url.to_string()))?;
    Ok(url)
}

#[derive(Clone, Default)]
pub struct RelayMetadataClient {
    http: reqwest::Client,
}

impl RelayMetadataClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn fetch(&self, relay_url: &str) -> Result<RelayMetadata, Error> {
        let url = metadata_url(relay_url)?;
        let metadata = self
            .http
            .get(url)
            .header(ACCEPT, NOSTR_JSON_MIME)
            .send()
            .await?
            .error_for_status()?
            .json::<RelayMetadata>()
            .await?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_url_switches_scheme() {
        assert_eq!(
            metadata_url("wss://relay.damus.io").unwrap().as_str(),
            "https://relay.damus.io/"
        );
        assert_eq!(
            metadata_url("ws://127.0.0.1:7777/nostr").unwrap().as_str(),
            "http://127.0.0.1:7777/nostr"
        );
        assert!(metadata_url("https://relay.damus.io").is_err());
    }

    #[test]
    fn test_parse_information_document() {
        let json = r#"{
            "name": "relay.one",
            "description": "A relay",
            "supported_nips": [1, 11, 42],
            "software": "git+https://example.com/relay",
            "limitation": {"max_subscriptions": 20}
        }"#;
        let metadata: RelayMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.name.as_deref(), Some("relay.one"));
        assert_eq!(metadata.supported_nips, vec![1, 11, 42]);
        assert!(metadata.pubkey.is_none());
    }
}
