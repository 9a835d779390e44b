//! Typed server configuration read from the environment.

use std::env;

use thiserror::Error;

const DEFAULT_DB_URL: &str = "chromalife.seed";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WORLD_SIZE: u32 = 1024;

pub const MIN_WORLD_SIZE: u32 = 2;
pub const MAX_WORLD_SIZE: u32 = 65536;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PORT is not a valid port number: {0:?}")]
    InvalidPort(String),

    #[error("WORLD_SIZE is not a number: {0:?}")]
    InvalidWorldSize(String),

    #[error("WORLD_SIZE must be a power of two in [{MIN_WORLD_SIZE}, {MAX_WORLD_SIZE}], got {0}")]
    WorldSizeOutOfRange(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the seed blob.
    pub db_url: String,
    pub port: u16,
    /// Edge length of the square torus. Power of two.
    pub world_size: u32,
}

impl Config {
    /// Reads `DB_URL`, `PORT` and `WORLD_SIZE`, falling back to defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_url = env::var("DB_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_string());
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };
        let world_size = match env::var("WORLD_SIZE") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidWorldSize(raw))?,
            Err(_) => DEFAULT_WORLD_SIZE,
        };

        let config = Self {
            db_url,
            port,
            world_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.world_size.is_power_of_two()
            || self.world_size < MIN_WORLD_SIZE
            || self.world_size > MAX_WORLD_SIZE
        {
            return Err(ConfigError::WorldSizeOutOfRange(self.world_size));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: DEFAULT_DB_URL.to_string(),
            port: DEFAULT_PORT,
            world_size: DEFAULT_WORLD_SIZE,
        }
    }
}
