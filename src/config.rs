// src/config.rs

use clap::{Parser, ValueEnum};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
    Maintenance,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Maintenance => "maintenance",
        })
    }
}

/// Server settings. Every flag falls back to an environment variable, and
/// `.env` is loaded before parsing.
#[derive(Debug, Clone, Parser)]
#[command(name = "maize-shop", about = "Maize storefront and back-office API", version)]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 4001)]
    pub port: u16,

    #[arg(long, env = "APP_ENV", value_enum, default_value_t = Environment::Development)]
    pub env: Environment,

    #[arg(long, env = "DATABASE_URL")]
    pub dsn: String,

    #[arg(long, env = "STRIPE_SECRET", hide_env_values = true)]
    pub stripe_secret: String,

    #[arg(long, env = "STRIPE_API_BASE", default_value = "https://api.stripe.com")]
    pub stripe_api_base: String,

    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:4000")]
    pub frontend_url: String,

    #[arg(long, env = "MAIL_FROM", default_value = "info@maize.local")]
    pub mail_from: String,

    /// Per-call bound on every database operation.
    #[arg(long, env = "DB_TIMEOUT_SECS", default_value_t = 3)]
    pub db_timeout_secs: u64,

    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    pub gateway_timeout_secs: u64,

    /// Attempts for idempotent provider reads.
    #[arg(long, env = "GATEWAY_RETRIES", default_value_t = 3)]
    pub gateway_retries: u32,
}

impl Config {
    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}
