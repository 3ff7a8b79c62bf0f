//! Configuration types

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::common::errors::{Result, SessionError};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Venue connection configuration
    #[serde(default)]
    pub venue: VenueConfig,
    /// Session timing and reconnect settings
    #[serde(default)]
    pub settings: SessionSettings,
    /// Martingale stake recovery
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Trade statistics window
    #[serde(default)]
    pub statistics: StatisticsConfig,
    /// Contract parameters used by the trade runner
    #[serde(default)]
    pub trade: TradeConfig,
}

/// Venue platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// WebSocket URL without query parameters
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
    /// Registered application id sent as `app_id`
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// Credential token; when present the session authorizes on every open
    #[serde(default)]
    pub api_token: Option<String>,
    /// Language code sent as `l`
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            websocket_url: default_websocket_url(),
            app_id: default_app_id(),
            api_token: None,
            language: default_language(),
        }
    }
}

impl VenueConfig {
    /// Full endpoint URL including the query parameters the venue expects
    pub fn endpoint(&self) -> Result<String> {
        let mut url = Url::parse(&self.websocket_url)
            .map_err(|e| SessionError::Configuration(format!("Invalid websocket_url: {}", e)))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::Configuration(format!(
                    "Unsupported websocket scheme: {}",
                    other
                )))
            }
        }

        url.query_pairs_mut()
            .append_pair("app_id", &self.app_id.to_string())
            .append_pair("l", &self.language);

        Ok(url.to_string())
    }

    /// Token to authorize with, ignoring blank values
    pub fn token(&self) -> Option<&str> {
        self.api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

fn default_websocket_url() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

fn default_app_id() -> u32 {
    1089
}

fn default_language() -> String {
    "EN".to_string()
}

/// Session timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Budget for ordinary requests in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Budget for history/bulk requests in milliseconds
    #[serde(default = "default_history_timeout")]
    pub history_timeout_ms: u64,
    /// Safety timeout for contract closure waits in seconds
    #[serde(default = "default_closure_timeout")]
    pub closure_timeout_secs: u64,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Ceiling for the growing reconnect delay in milliseconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
    /// Maximum consecutive reconnection attempts (0 = infinite, still backed off)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Keep-alive ping interval in seconds (0 disables)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Buffer size of the session event channel
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            request_timeout_ms: default_request_timeout(),
            history_timeout_ms: default_history_timeout(),
            closure_timeout_secs: default_closure_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            event_channel_size: default_event_channel_size(),
        }
    }
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn closure_timeout(&self) -> Duration {
        Duration::from_secs(self.closure_timeout_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_history_timeout() -> u64 {
    15_000
}

fn default_closure_timeout() -> u64 {
    300
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_event_channel_size() -> usize {
    1000
}

/// Martingale recovery parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Stake used after a win and for the first trade
    #[serde(default = "default_base_stake")]
    pub base_stake: Decimal,
    /// Factor applied per consecutive loss
    #[serde(default = "default_multiplier")]
    pub multiplier: Decimal,
    /// Ceiling above which trading stops
    #[serde(default = "default_max_stake")]
    pub max_stake: Decimal,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_stake: default_base_stake(),
            multiplier: default_multiplier(),
            max_stake: default_max_stake(),
        }
    }
}

fn default_base_stake() -> Decimal {
    dec!(1)
}

fn default_multiplier() -> Decimal {
    dec!(2)
}

fn default_max_stake() -> Decimal {
    dec!(50)
}

/// Statistics window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Number of outcomes kept before the oldest is dropped
    #[serde(default = "default_statistics_capacity")]
    pub capacity: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            capacity: default_statistics_capacity(),
        }
    }
}

fn default_statistics_capacity() -> usize {
    1000
}

/// Contract parameters for the trade runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_contract_type")]
    pub contract_type: String,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default = "default_duration_unit")]
    pub duration_unit: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            contract_type: default_contract_type(),
            duration: default_duration(),
            duration_unit: default_duration_unit(),
            currency: default_currency(),
        }
    }
}

fn default_symbol() -> String {
    "R_100".to_string()
}

fn default_contract_type() -> String {
    "CALL".to_string()
}

fn default_duration() -> u32 {
    5
}

fn default_duration_unit() -> String {
    "t".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_query() {
        let venue = VenueConfig::default();
        let endpoint = venue.endpoint().unwrap();
        assert_eq!(
            endpoint,
            "wss://ws.derivws.com/websockets/v3?app_id=1089&l=EN"
        );
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let venue = VenueConfig {
            websocket_url: "https://example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            venue.endpoint(),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_blank_token_is_absent() {
        let venue = VenueConfig {
            api_token: Some("   ".into()),
            ..Default::default()
        };
        assert!(venue.token().is_none());
    }

    #[test]
    fn test_default_timeouts() {
        let settings = SessionSettings::default();
        assert_eq!(settings.request_timeout(), Duration::from_secs(10));
        assert_eq!(settings.history_timeout(), Duration::from_secs(15));
        assert_eq!(settings.closure_timeout(), Duration::from_secs(300));
    }
}
