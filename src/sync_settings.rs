use crate::types::{ChainFamily, Token};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "walletsync_settings.json";

fn default_evm_fast_minutes() -> f64 {
    1.0
}

fn default_evm_slow_minutes() -> f64 {
    3.0
}

fn default_utxo_fast_minutes() -> f64 {
    2.0
}

fn default_utxo_slow_minutes() -> f64 {
    5.0
}

fn default_lookback_blocks() -> u64 {
    30
}

fn default_utxo_page_size() -> u32 {
    30
}

fn default_fallback_pool_size() -> usize {
    3
}

fn default_fallback_group_pause_ms() -> u64 {
    100
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_lock_wait_timeout_secs() -> u64 {
    10
}

/// Tunables that persist between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Account-model poll interval while transactions are pending or a UI is open
    #[serde(default = "default_evm_fast_minutes")]
    pub evm_fast_interval_minutes: f64,
    #[serde(default = "default_evm_slow_minutes")]
    pub evm_slow_interval_minutes: f64,
    #[serde(default = "default_utxo_fast_minutes")]
    pub utxo_fast_interval_minutes: f64,
    #[serde(default = "default_utxo_slow_minutes")]
    pub utxo_slow_interval_minutes: f64,
    /// Number of recent blocks re-scanned on every account-model poll
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Number of recent transactions requested from the UTXO indexer
    #[serde(default = "default_utxo_page_size")]
    pub utxo_page_size: u32,
    /// Concurrency of per-item fallback RPC calls
    #[serde(default = "default_fallback_pool_size")]
    pub fallback_pool_size: usize,
    /// Pause added per group of `fallback_pool_size` fallback calls
    #[serde(default = "default_fallback_group_pause_ms")]
    pub fallback_group_pause_ms: u64,
    /// A schedule lock older than this is considered abandoned
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_wait_timeout_secs")]
    pub lock_wait_timeout_secs: u64,
    /// Tokens whose balances are refreshed, per EVM chain id
    #[serde(default)]
    pub tracked_tokens: HashMap<u64, Vec<Token>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            evm_fast_interval_minutes: default_evm_fast_minutes(),
            evm_slow_interval_minutes: default_evm_slow_minutes(),
            utxo_fast_interval_minutes: default_utxo_fast_minutes(),
            utxo_slow_interval_minutes: default_utxo_slow_minutes(),
            lookback_blocks: default_lookback_blocks(),
            utxo_page_size: default_utxo_page_size(),
            fallback_pool_size: default_fallback_pool_size(),
            fallback_group_pause_ms: default_fallback_group_pause_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_timeout_secs: default_lock_wait_timeout_secs(),
            tracked_tokens: HashMap::new(),
        }
    }
}

impl SyncSettings {
    /// Get the settings file path
    fn settings_path() -> PathBuf {
        crate::config::app_data_dir().join(SETTINGS_FILE)
    }

    /// Load settings from the app data dir, or return defaults if not found
    pub fn load() -> Self {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => {
                        tracing::info!("Loaded settings from {:?}", path);
                        return Self::validated(settings);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse settings file: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read settings file: {}", e);
                }
            }
        }
        tracing::info!("Using default settings");
        Self::default()
    }

    /// Replace unusable poll intervals with their defaults.
    fn validated(mut settings: Self) -> Self {
        let checks: [(&str, &mut f64, fn() -> f64); 4] = [
            ("evm_fast_interval_minutes", &mut settings.evm_fast_interval_minutes, default_evm_fast_minutes),
            ("evm_slow_interval_minutes", &mut settings.evm_slow_interval_minutes, default_evm_slow_minutes),
            ("utxo_fast_interval_minutes", &mut settings.utxo_fast_interval_minutes, default_utxo_fast_minutes),
            ("utxo_slow_interval_minutes", &mut settings.utxo_slow_interval_minutes, default_utxo_slow_minutes),
        ];
        for (field, value, default) in checks {
            if !value.is_finite() || *value <= 0.0 {
                tracing::warn!("Invalid {} ({}), using default {}", field, value, default());
                *value = default();
            }
        }
        settings
    }

    /// Save settings to the app data dir
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Poll interval in minutes for a chain family.
    pub fn interval_minutes(&self, family: ChainFamily, active: bool) -> f64 {
        match (family, active) {
            (ChainFamily::Evm, true) => self.evm_fast_interval_minutes,
            (ChainFamily::Evm, false) => self.evm_slow_interval_minutes,
            (ChainFamily::Utxo, true) => self.utxo_fast_interval_minutes,
            (ChainFamily::Utxo, false) => self.utxo_slow_interval_minutes,
        }
    }

    pub fn fallback_group_pause(&self) -> Duration {
        Duration::from_millis(self.fallback_group_pause_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    pub fn tokens_for(&self, chain_id: u64) -> &[Token] {
        self.tracked_tokens
            .get(&chain_id)
            .map(|t| t.as_slice())
            .unwrap_or(&[])
    }

    /// Track a token (returns false if it is already tracked)
    pub fn add_token(&mut self, chain_id: u64, token: Token) -> bool {
        let tokens = self.tracked_tokens.entry(chain_id).or_default();
        if tokens.iter().any(|t| t.address == token.address) {
            return false;
        }
        tokens.push(token);
        true
    }

    /// Stop tracking a token
    pub fn remove_token(&mut self, chain_id: u64, token: &Token) -> bool {
        let Some(tokens) = self.tracked_tokens.get_mut(&chain_id) else {
            return false;
        };
        let initial_len = tokens.len();
        tokens.retain(|t| t.address != token.address);
        tokens.len() < initial_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn token(n: u64) -> Token {
        Token {
            address: Address::from_low_u64_be(n),
            decimals: 18,
        }
    }

    #[test]
    fn test_default_intervals() {
        let settings = SyncSettings::default();
        assert_eq!(settings.interval_minutes(ChainFamily::Evm, true), 1.0);
        assert_eq!(settings.interval_minutes(ChainFamily::Evm, false), 3.0);
        assert_eq!(settings.interval_minutes(ChainFamily::Utxo, true), 2.0);
        assert_eq!(settings.interval_minutes(ChainFamily::Utxo, false), 5.0);
    }

    #[test]
    fn test_default_values() {
        let settings = SyncSettings::default();
        assert_eq!(settings.lookback_blocks, 30);
        assert_eq!(settings.utxo_page_size, 30);
        assert_eq!(settings.fallback_pool_size, 3);
        assert_eq!(settings.fallback_group_pause(), Duration::from_millis(100));
        assert!(settings.tracked_tokens.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: SyncSettings = serde_json::from_str(r#"{"lookback_blocks": 10}"#).unwrap();
        assert_eq!(settings.lookback_blocks, 10);
        assert_eq!(settings.evm_fast_interval_minutes, 1.0);
        assert_eq!(settings.fallback_pool_size, 3);
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = SyncSettings::default();
        settings.evm_slow_interval_minutes = 10.0;
        settings.add_token(1, token(7));
        settings.save_to(&path).unwrap();

        let loaded = SyncSettings::load_from(&path);
        assert_eq!(loaded.evm_slow_interval_minutes, 10.0);
        assert_eq!(loaded.tokens_for(1), &[token(7)]);
    }

    #[test]
    fn test_load_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        let loaded = SyncSettings::load_from(&path);
        assert_eq!(loaded.lookback_blocks, 30);
    }

    #[test]
    fn test_load_replaces_invalid_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"evm_slow_interval_minutes": -1.0, "utxo_fast_interval_minutes": 0.0, "evm_fast_interval_minutes": 0.5}"#,
        )
        .unwrap();

        let loaded = SyncSettings::load_from(&path);
        assert_eq!(loaded.evm_slow_interval_minutes, 3.0);
        assert_eq!(loaded.utxo_fast_interval_minutes, 2.0);
        assert_eq!(loaded.evm_fast_interval_minutes, 0.5);
    }

    #[test]
    fn test_add_token_rejects_duplicates() {
        let mut settings = SyncSettings::default();
        assert!(settings.add_token(1, token(1)));
        assert!(!settings.add_token(1, token(1)));
        assert!(settings.add_token(137, token(1)));
        assert_eq!(settings.tokens_for(1).len(), 1);
    }

    #[test]
    fn test_remove_token() {
        let mut settings = SyncSettings::default();
        settings.add_token(1, token(1));
        assert!(settings.remove_token(1, &token(1)));
        assert!(!settings.remove_token(1, &token(1)));
        assert!(!settings.remove_token(5, &token(1)));
        assert!(settings.tokens_for(1).is_empty());
    }
}
