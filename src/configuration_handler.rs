use crate::configuration::Configuration;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "counsel_booking")]
#[command(about = "Booking coordinator for counseling sessions", long_about = None)]
#[command(version)]
pub struct ConfigurationHandler {
    #[arg(long, env = "PORT", default_value = "3000")]
    port: String,

    /// PostgreSQL connection URL. Bookings are kept in memory when absent.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "WEBHOOK_SECRET")]
    webhook_secret: String,

    /// Upper bound for a single store call, in milliseconds.
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 5000)]
    store_timeout_ms: u64,

    /// Pause before retrying an idempotent read, in milliseconds.
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 200)]
    retry_backoff_ms: u64,

    #[arg(long, env = "ALLOWED_ORIGIN")]
    allowed_origin: Option<String>,
}

impl ConfigurationHandler {
    /// Reads flags, falling back to the environment and a `.env` file.
    pub fn parse_arguments() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }
}

impl Configuration for ConfigurationHandler {
    fn port(&self) -> String {
        self.port.clone()
    }

    fn database_url(&self) -> Option<String> {
        self.database_url.clone()
    }

    fn webhook_secret(&self) -> String {
        self.webhook_secret.clone()
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn allowed_origin(&self) -> Option<String> {
        self.allowed_origin.clone()
    }
}
