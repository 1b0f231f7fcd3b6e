use nipsigner_core::{Kind, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_GIFT_WRAP, KIND_NOSTR_CONNECT, KIND_SEALED_GROUP_WRAP};
use serde::{Deserialize, Serialize};

use crate::error::SignerError;
use crate::signers::EncryptionScheme;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub encryption: EncryptionConfig,
    pub gift_wrap: GiftWrapConfig,
    pub extension: ExtensionConfig,
    pub remote: RemoteSignerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Session-wide scheme used when the caller does not ask for one.
    pub preferred_scheme: Option<EncryptionScheme>,
    /// Kinds that always use NIP-04, whatever the caller asks for.
    pub legacy_kinds: Vec<Kind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GiftWrapConfig {
    pub scheme: EncryptionScheme,
    pub wrap_kind: Kind,
    /// Timestamps are pushed back by up to 10^n seconds.
    pub time_drift_exponent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub base_retry_delay_ms: u64, // milliseconds
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSignerConfig {
    /// Relays used for RPC traffic when the connection token carries none
    pub relays: Vec<String>,
    /// Scheme for `encrypt`/`decrypt` calls forwarded to the agent
    pub preferred_scheme: EncryptionScheme,
    /// Scheme used to encrypt the RPC envelopes themselves
    pub transport_scheme: EncryptionScheme,
    pub app_name: Option<String>,
    /// Comma separated permissions requested on `connect`
    pub perms: Option<String>,
    pub request_timeout_ms: Option<u64>, // milliseconds, None waits forever
    pub rpc_kind: Kind,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            preferred_scheme: None,
            legacy_kinds: vec![KIND_ENCRYPTED_DIRECT_MESSAGE],
        }
    }
}

impl Default for GiftWrapConfig {
    fn default() -> Self {
        Self {
            scheme: EncryptionScheme::Nip44,
            wrap_kind: KIND_GIFT_WRAP,
            time_drift_exponent: 5,
        }
    }
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: 100,
            max_retries: 5,
        }
    }
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            preferred_scheme: EncryptionScheme::Nip44,
            transport_scheme: EncryptionScheme::Nip44,
            app_name: None,
            perms: None,
            request_timeout_ms: None,
            rpc_kind: KIND_NOSTR_CONNECT,
        }
    }
}

impl EncryptionConfig {
    pub fn with_preferred_scheme(mut self, scheme: EncryptionScheme) -> Self {
        self.preferred_scheme = Some(scheme);
        self
    }

    pub fn with_legacy_kinds(mut self, kinds: Vec<Kind>) -> Self {
        self.legacy_kinds = kinds;
        self
    }

    pub fn is_legacy_kind(&self, kind: Kind) -> bool {
        self.legacy_kinds.contains(&kind)
    }
}

impl SignerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), SignerError> {
        if self.extension.max_retries == 0 {
            return Err(SignerError::Config("Max retries must be greater than 0".to_string()));
        }

        if self.gift_wrap.time_drift_exponent > 9 {
            return Err(SignerError::Config("Time drift exponent should not exceed 9".to_string()));
        }

        if ![KIND_GIFT_WRAP, KIND_SEALED_GROUP_WRAP].contains(&self.gift_wrap.wrap_kind) {
            return Err(SignerError::Config(format!(
                "Wrap kind must be {} or {}",
                KIND_GIFT_WRAP, KIND_SEALED_GROUP_WRAP
            )));
        }

        if self.remote.request_timeout_ms == Some(0) {
            return Err(SignerError::Config("Request timeout must be greater than 0".to_string()));
        }

        for relay in &self.remote.relays {
            let parsed = url::Url::parse(relay)
                .map_err(|e| SignerError::Config(format!("Invalid relay url {}: {}", relay, e)))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(SignerError::Config(format!("Relay url must use ws or wss: {}", relay)));
            }
        }

        Ok(())
    }

    pub fn with_preferred_scheme(mut self, scheme: EncryptionScheme) -> Self {
        self.encryption.preferred_scheme = Some(scheme);
        self
    }

    pub fn with_remote_relays(mut self, relays: Vec<String>) -> Self {
        self.remote.relays = relays;
        self
    }

    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.remote.request_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_sealed_group_wraps(mut self) -> Self {
        self.gift_wrap.wrap_kind = KIND_SEALED_GROUP_WRAP;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SignerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.extension.max_retries, 5);
        assert_eq!(config.gift_wrap.time_drift_exponent, 5);
        assert!(config.remote.request_timeout_ms.is_none());
        assert!(config.encryption.is_legacy_kind(4));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SignerConfig::default();
        config.extension.max_retries = 0;
        assert!(config.validate().is_err());

        let config = SignerConfig::default().with_request_timeout(0);
        assert!(config.validate().is_err());

        let mut config = SignerConfig::default();
        config.gift_wrap.time_drift_exponent = 12;
        assert!(config.validate().is_err());

        let config = SignerConfig::default().with_remote_relays(vec!["https://relay.example".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_with_partial_input() {
        let config = SignerConfig::from_json(r#"{"encryption":{"preferred_scheme":"nip04"}}"#).unwrap();
        assert_eq!(config.encryption.preferred_scheme, Some(EncryptionScheme::Nip04));
        assert_eq!(config.encryption.legacy_kinds, vec![4]);

        let json = config.with_sealed_group_wraps().to_json().unwrap();
        let parsed = SignerConfig::from_json(&json).unwrap();
        assert_eq!(parsed.gift_wrap.wrap_kind, 1060);
    }
}
