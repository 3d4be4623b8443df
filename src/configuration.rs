use std::time::Duration;

pub trait Configuration: Clone + Send + Sync + 'static {
    fn port(&self) -> String;
    /// `None` runs the service on the in-memory backend.
    fn database_url(&self) -> Option<String>;
    /// Shared secret the payment gateway sends in `x-webhook-secret`.
    fn webhook_secret(&self) -> String;
    fn store_timeout(&self) -> Duration;
    fn retry_backoff(&self) -> Duration;
    /// `None` allows any origin.
    fn allowed_origin(&self) -> Option<String>;
}
