use crate::types::{ChainFamily, ChainKey};
use anyhow::{anyhow, Context, Result};
use ethers::providers::{Http, Provider};
use ethers::types::Address;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Multicall3, deployed at the same address on most EVM chains.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// A predefined network with label, chain key, native token and default endpoint.
///
/// For account-model chains the endpoint is a JSON-RPC URL, for UTXO chains it is
/// the base URL of a Blockbook indexer.
#[derive(Clone, Debug)]
pub struct Network {
    pub label: &'static str,
    pub family: ChainFamily,
    /// EVM chain id, or SLIP-44 coin type for UTXO chains
    pub chain_id: u64,
    pub native_token: &'static str,
    pub default_endpoint: &'static str,
    /// Aggregator contract used for batched balance reads
    pub aggregator: Option<&'static str>,
}

impl Network {
    pub const fn evm(
        label: &'static str,
        chain_id: u64,
        native_token: &'static str,
        default_endpoint: &'static str,
        aggregator: Option<&'static str>,
    ) -> Self {
        Self {
            label,
            family: ChainFamily::Evm,
            chain_id,
            native_token,
            default_endpoint,
            aggregator,
        }
    }

    pub const fn utxo(
        label: &'static str,
        coin_type: u64,
        native_token: &'static str,
        default_endpoint: &'static str,
    ) -> Self {
        Self {
            label,
            family: ChainFamily::Utxo,
            chain_id: coin_type,
            native_token,
            default_endpoint,
            aggregator: None,
        }
    }

    pub fn chain(&self) -> ChainKey {
        ChainKey {
            family: self.family,
            chain_id: self.chain_id,
        }
    }
}

const MC3: Option<&str> = Some(MULTICALL3_ADDRESS);

/// Built-in networks.
pub const NETWORKS: &[Network] = &[
    Network::evm("Ethereum", 1, "ETH", "https://ethereum-rpc.publicnode.com", MC3),
    Network::evm("Sepolia", 11155111, "ETH", "https://ethereum-sepolia-rpc.publicnode.com", MC3),
    Network::evm("Hoodi", 560048, "ETH", "https://rpc.hoodi.ethpandaops.io", None),
    Network::evm("Optimism", 10, "ETH", "https://mainnet.optimism.io", MC3),
    Network::evm("Base", 8453, "ETH", "https://mainnet.base.org", MC3),
    Network::evm("Polygon", 137, "POL", "https://polygon-rpc.com", MC3),
    Network::evm("Linea", 59144, "ETH", "https://rpc.linea.build", MC3),
    Network::evm("Gnosis Chain", 100, "xDAI", "https://rpc.gnosischain.com", MC3),
    Network::evm("BNB Chain", 56, "BNB", "https://bsc-dataseed.binance.org", MC3),
    Network::evm("Avalanche C-Chain", 43114, "AVAX", "https://avalanche-c-chain-rpc.publicnode.com", MC3),
    Network::evm("Celo", 42220, "CELO", "https://forno.celo.org", MC3),
    Network::utxo("Bitcoin", 0, "BTC", "https://btc1.trezor.io"),
    Network::utxo("Bitcoin Testnet", 1, "tBTC", "https://tbtc1.trezor.io"),
    Network::utxo("Litecoin", 2, "LTC", "https://ltc1.trezor.io"),
    Network::utxo("Dogecoin", 3, "DOGE", "https://doge1.trezor.io"),
];

/// Find a network by chain key
pub fn find_network(chain: ChainKey) -> Option<&'static Network> {
    NETWORKS
        .iter()
        .find(|n| n.family == chain.family && n.chain_id == chain.chain_id)
}

/// Runtime configuration for one sync target.
#[derive(Clone, Debug)]
pub struct Config {
    /// JSON-RPC endpoint (account-model) or indexer base URL (UTXO)
    pub endpoint: String,
    pub chain: ChainKey,
    pub aggregator_override: Option<Address>,
    /// Location of the persisted state document
    pub state_file: PathBuf,
    pub label_override: Option<String>,
}

impl Config {
    pub fn new(endpoint: String, chain: ChainKey) -> Self {
        Self {
            endpoint,
            chain,
            aggregator_override: None,
            state_file: default_state_file(),
            label_override: None,
        }
    }

    pub fn from_network(network: &Network) -> Self {
        Self::new(network.default_endpoint.to_string(), network.chain())
    }

    /// Build from environment variables, falling back to the built-in network table.
    ///
    /// `WALLETSYNC_FAMILY` (evm|utxo), `WALLETSYNC_CHAIN_ID`, `WALLETSYNC_RPC_URL`,
    /// `WALLETSYNC_BACKEND_URL`, `WALLETSYNC_AGGREGATOR`, `WALLETSYNC_STATE_FILE`.
    pub fn from_env() -> Result<Self> {
        let family = match env::var("WALLETSYNC_FAMILY").ok().as_deref() {
            None | Some("evm") => ChainFamily::Evm,
            Some("utxo") => ChainFamily::Utxo,
            Some(other) => return Err(anyhow!("Unknown chain family '{}'", other)),
        };
        let chain_id = match env::var("WALLETSYNC_CHAIN_ID") {
            Ok(v) => v
                .trim()
                .parse()
                .with_context(|| format!("Invalid WALLETSYNC_CHAIN_ID '{}'", v))?,
            Err(_) => match family {
                ChainFamily::Evm => 11155111,
                ChainFamily::Utxo => 0,
            },
        };
        let chain = ChainKey { family, chain_id };

        let endpoint_var = match family {
            ChainFamily::Evm => "WALLETSYNC_RPC_URL",
            ChainFamily::Utxo => "WALLETSYNC_BACKEND_URL",
        };
        let endpoint = match env::var(endpoint_var) {
            Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => find_network(chain)
                .map(|n| n.default_endpoint.to_string())
                .ok_or_else(|| anyhow!("{} must be set for unknown chain {}", endpoint_var, chain))?,
        };
        Url::parse(&endpoint).with_context(|| format!("Invalid endpoint URL '{}'", endpoint))?;

        let mut config = Self::new(endpoint, chain);
        if let Ok(addr) = env::var("WALLETSYNC_AGGREGATOR") {
            config.aggregator_override = Some(
                addr.trim()
                    .parse()
                    .with_context(|| format!("Invalid WALLETSYNC_AGGREGATOR '{}'", addr))?,
            );
        }
        if let Ok(path) = env::var("WALLETSYNC_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        Ok(config)
    }

    pub fn network_label(&self) -> &str {
        if let Some(ref label) = self.label_override {
            label.as_str()
        } else {
            find_network(self.chain).map(|n| n.label).unwrap_or("Unknown")
        }
    }

    /// Aggregator contract for this chain, if any.
    pub fn aggregator_address(&self) -> Option<Address> {
        self.aggregator_override.or_else(|| {
            find_network(self.chain)
                .and_then(|n| n.aggregator)
                .and_then(|a| a.parse().ok())
        })
    }

    pub async fn get_provider(&self) -> Result<Arc<Provider<Http>>> {
        let url = Url::parse(&self.endpoint)?;
        let provider = Provider::<Http>::try_from(url.as_str())?;
        Ok(Arc::new(provider))
    }
}

impl Default for Config {
    fn default() -> Self {
        if let Some(sepolia) = find_network(ChainKey::evm(11155111)) {
            Self::from_network(sepolia)
        } else {
            Self::new("https://rpc.sepolia.org".to_string(), ChainKey::evm(11155111))
        }
    }
}

/// App data directory, created on first use.
pub fn app_data_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        let app_dir = config_dir.join("walletsync");
        if !app_dir.exists() {
            let _ = std::fs::create_dir_all(&app_dir);
        }
        app_dir
    } else {
        PathBuf::from(".")
    }
}

fn default_state_file() -> PathBuf {
    app_data_dir().join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_network_ethereum() {
        let network = find_network(ChainKey::evm(1)).unwrap();
        assert_eq!(network.label, "Ethereum");
        assert_eq!(network.native_token, "ETH");
    }

    #[test]
    fn test_find_network_utxo_by_coin_type() {
        let network = find_network(ChainKey::utxo(2)).unwrap();
        assert_eq!(network.label, "Litecoin");
        assert_eq!(network.family, ChainFamily::Utxo);
    }

    #[test]
    fn test_find_network_family_must_match() {
        // chain id 1 is Ethereum, coin type 1 is Bitcoin Testnet
        assert_eq!(find_network(ChainKey::utxo(1)).unwrap().label, "Bitcoin Testnet");
        assert!(find_network(ChainKey::utxo(999)).is_none());
    }

    #[test]
    fn test_aggregator_from_network_table() {
        let config = Config::from_network(find_network(ChainKey::evm(137)).unwrap());
        let expected: Address = MULTICALL3_ADDRESS.parse().unwrap();
        assert_eq!(config.aggregator_address(), Some(expected));
    }

    #[test]
    fn test_aggregator_missing_on_hoodi() {
        let config = Config::from_network(find_network(ChainKey::evm(560048)).unwrap());
        assert!(config.aggregator_address().is_none());
    }

    #[test]
    fn test_aggregator_override_wins() {
        let mut config = Config::new("https://example.com".to_string(), ChainKey::evm(999999));
        assert!(config.aggregator_address().is_none());
        let custom = Address::from_low_u64_be(0x42);
        config.aggregator_override = Some(custom);
        assert_eq!(config.aggregator_address(), Some(custom));
    }

    #[test]
    fn test_network_label() {
        let config = Config::new("https://example.com".to_string(), ChainKey::evm(999999));
        assert_eq!(config.network_label(), "Unknown");
        let config = Config::default();
        assert_eq!(config.network_label(), "Sepolia");
    }

    #[test]
    fn test_all_aggregators_parse() {
        for network in NETWORKS.iter().filter(|n| n.aggregator.is_some()) {
            let config = Config::from_network(network);
            assert!(config.aggregator_address().is_some(), "{}", network.label);
        }
    }
}
