use anyhow::Result;
use dotenvy::dotenv;
use std::env;

/// Connection configuration loaded from environment variables.
///
/// Both URLs are optional: fixture-file runs need neither, and a
/// fixture run with a missing `DATABASE_URL` falls back to an
/// in-memory ID map (resumable only through the state file).
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the ID map lives (the destination site's database).
    pub database_url: Option<String>,
    /// The legacy store rows are migrated out of.
    pub source_database_url: Option<String>,
    /// Prefix prepended to every source table name.
    pub source_table_prefix: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            source_database_url: env::var("SOURCE_DATABASE_URL").ok(),
            source_table_prefix: env::var("SOURCE_TABLE_PREFIX").ok(),
        })
    }
}
