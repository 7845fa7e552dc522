//! Process configuration, read once at startup from flags or the environment.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::auth::BasicAuth;

#[derive(Parser, Clone)]
#[command(name = "pod-index", version, about = "Watch-driven pod index with HTTP lookups by UID")]
pub struct Config {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Basic auth username; the gate is on only when username and password are both set
    #[arg(long = "basic-auth-username", env = "BASIC_AUTH_USERNAME", default_value = "")]
    pub auth_username: String,

    /// Basic auth password
    #[arg(long = "basic-auth-password", env = "BASIC_AUTH_PASSWORD", default_value = "", hide_env_values = true)]
    pub auth_password: String,

    /// Restrict the watch to one namespace (default: all namespaces)
    #[arg(long = "namespace", env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Give up startup if the initial pod listing has not been applied by then
    #[arg(long, env = "SYNC_TIMEOUT_SECS", default_value_t = 120)]
    pub sync_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Per-request timeout
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Capacity of the watch → ingest queue
    #[arg(long, env = "POD_INDEX_QUEUE_CAP", default_value_t = 2048)]
    pub queue_cap: usize,

    /// Prometheus exporter listen address (ip:port); exporter is off when unset
    #[arg(long, env = "POD_INDEX_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], self.port)) }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref().filter(|ns| !ns.is_empty()) }

    pub fn basic_auth(&self) -> BasicAuth { BasicAuth::new(self.auth_username.clone(), self.auth_password.clone()) }

    pub fn sync_timeout(&self) -> Duration { Duration::from_secs(self.sync_timeout_secs) }

    pub fn shutdown_grace(&self) -> Duration { Duration::from_secs(self.shutdown_grace_secs) }

    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("auth_username", &self.auth_username)
            .field("auth_password", &if self.auth_password.is_empty() { "" } else { "<redacted>" })
            .field("namespace", &self.namespace)
            .field("sync_timeout_secs", &self.sync_timeout_secs)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("queue_cap", &self.queue_cap)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}
