//! Application configuration.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./omnitrader.db?mode=rwc";
pub const DEFAULT_CDP_ENDPOINT: &str = "http://127.0.0.1:9222";
pub const DEFAULT_SYMBOL: &str = "BTCUSDT";

/// Where state lives, which browser to drive and what to trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite URL for session state and trade history
    pub database_url: String,

    /// DevTools HTTP endpoint of a browser started with remote debugging
    pub cdp_endpoint: String,

    /// Symbol attached to every order and price request
    pub symbol: String,

    /// Drive an in-process simulated page instead of the browser
    pub simulate: bool,

    /// Keep state in memory only
    pub ephemeral: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            cdp_endpoint: DEFAULT_CDP_ENDPOINT.to_string(),
            symbol: DEFAULT_SYMBOL.to_string(),
            simulate: false,
            ephemeral: false,
        }
    }
}

impl AppConfig {
    pub fn with_mode(mut self, simulate: bool, ephemeral: bool) -> Self {
        self.simulate = simulate;
        self.ephemeral = ephemeral;
        self
    }

    /// One-line description for the startup banner.
    pub fn describe(&self) -> String {
        let pages = if self.simulate {
            "simulated page".to_string()
        } else {
            format!("browser at {}", self.cdp_endpoint)
        };
        let storage = if self.ephemeral {
            "memory".to_string()
        } else {
            self.database_url.clone()
        };
        format!("symbol {}, {}, state in {}", self.symbol, pages, storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.cdp_endpoint, DEFAULT_CDP_ENDPOINT);
        assert_eq!(config.symbol, "BTCUSDT");
        assert!(!config.simulate);
    }

    #[test]
    fn test_describe_reflects_mode() {
        let config = AppConfig::default().with_mode(true, true);
        assert_eq!(config.describe(), "symbol BTCUSDT, simulated page, state in memory");
    }
}
