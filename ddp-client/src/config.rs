//! Connection configuration.

use serde::Deserialize;

use crate::protocol::SUPPORTED_VERSIONS;

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Endpoint handed to the transport, e.g. `ws://host:3000/websocket`.
    pub url: String,
    /// Protocol versions offered in `connect`, most preferred first.
    pub supported_versions: Vec<String>,
    /// Session id to resume on the first `connect`.
    pub session: Option<String>,
    /// Outgoing frame buffer of the WebSocket transport.
    pub outgoing_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/websocket".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            session: None,
            outgoing_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Version proposed in `connect`.
    pub fn preferred_version(&self) -> &str {
        self.supported_versions
            .first()
            .map(String::as_str)
            .unwrap_or(SUPPORTED_VERSIONS[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.supported_versions, vec!["1", "pre2", "pre1"]);
        assert_eq!(config.preferred_version(), "1");
        assert!(config.session.is_none());
        assert_eq!(config.outgoing_capacity, 256);
    }

    #[test]
    fn test_builders() {
        let config = ConnectionConfig::new("ws://example.com/websocket")
            .with_versions(["pre2", "pre1"])
            .with_session("s-1");
        assert_eq!(config.url, "ws://example.com/websocket");
        assert_eq!(config.preferred_version(), "pre2");
        assert_eq!(config.session.as_deref(), Some("s-1"));
    }

    #[test]
    fn test_from_json_partial() {
        let config = ConnectionConfig::from_json(r#"{"url": "ws://h/websocket", "session": "abc"}"#).unwrap();
        assert_eq!(config.url, "ws://h/websocket");
        assert_eq!(config.session.as_deref(), Some("abc"));
        assert_eq!(config.supported_versions.len(), 3);
    }

    #[test]
    fn test_empty_versions_fall_back() {
        let config = ConnectionConfig::default().with_versions(Vec::<String>::new());
        assert_eq!(config.preferred_version(), "1");
    }
}
