//! Configuration loader

use config::{Config, Environment, File};
use std::path::Path;

use super::types::AppConfig;
use crate::common::errors::{Result, SessionError};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with APP_, `__` between sections)
/// 2. Configuration file (TOML format)
/// 3. Default values
///
/// `VENUE_API_TOKEN` fills in the credential token when neither source set it.
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| SessionError::Configuration(e.to_string()))?;

    let mut app: AppConfig = config
        .try_deserialize()
        .map_err(|e| SessionError::Configuration(e.to_string()))?;

    if app.venue.token().is_none() {
        app.venue.api_token = std::env::var("VENUE_API_TOKEN").ok();
    }

    Ok(app)
}

/// Load configuration from environment variables only
pub fn load_from_env() -> Result<AppConfig> {
    dotenvy::dotenv().ok();

    let defaults = super::types::VenueConfig::default();
    let app_id = match std::env::var("VENUE_APP_ID") {
        Ok(raw) => raw
            .parse()
            .map_err(|e| SessionError::Configuration(format!("Invalid VENUE_APP_ID: {}", e)))?,
        Err(_) => defaults.app_id,
    };

    let venue = super::types::VenueConfig {
        websocket_url: std::env::var("VENUE_WS_URL").unwrap_or(defaults.websocket_url),
        app_id,
        api_token: std::env::var("VENUE_API_TOKEN").ok(),
        language: std::env::var("VENUE_LANGUAGE").unwrap_or(defaults.language),
    };

    Ok(AppConfig {
        venue,
        ..Default::default()
    })
}
