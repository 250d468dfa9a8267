use crate::backend::pool::PoolConfig;
use crate::backend::router::RoutingStrategy;
use crate::backend::BackendInstance;
use crate::tls::{ClientSslMode, ServerSslMode};

use clap::Parser;
use itertools::Itertools;
use std::str::FromStr;
use std::time::Duration;

/// One named route: a frontend listener plus the upstreams it forwards to.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub name: String,
    pub bind_addr: String,
    pub destinations: Vec<BackendInstance>,
    pub strategy: RoutingStrategy,
    pub client_ssl_mode: ClientSslMode,
    pub server_ssl_mode: ServerSslMode,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub connection_sharing: bool,
    pub connection_sharing_delay: Duration,
    /// 0 means a failed backend connect is not retried.
    pub connect_retry_timeout: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            bind_addr: "0.0.0.0:6446".to_string(),
            destinations: Vec::new(),
            strategy: RoutingStrategy::default(),
            client_ssl_mode: ClientSslMode::default(),
            server_ssl_mode: ServerSslMode::default(),
            tls_cert_path: None,
            tls_key_path: None,
            connection_sharing: false,
            connection_sharing_delay: Duration::from_secs(1),
            connect_retry_timeout: Duration::from_secs(7),
        }
    }
}

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "sql-router",
    version = "0.1.0",
    about = "MySQL classic-protocol router with connection sharing."
)]
pub struct RouterServerArgs {
    #[clap(long, value_name = "WORKERS", default_value_t = 4)]
    pub workers: usize,
    #[clap(long, value_name = "PORT", default_value_t = 6446)]
    pub port: u16,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "ROUTE_NAME", default_value = "default")]
    pub route_name: String,
    #[clap(
        long,
        value_name = "ADDR,...",
        help = "comma separated backend addresses (host:port or socket path)"
    )]
    pub destinations: String,
    #[clap(long, value_name = "STRATEGY", default_value = "round-robin")]
    pub routing_strategy: String,
    #[clap(long, value_name = "MODE", default_value = "preferred")]
    pub client_ssl_mode: String,
    #[clap(long, value_name = "MODE", default_value = "as_client")]
    pub server_ssl_mode: String,
    #[clap(long, value_name = "PEM")]
    pub tls_cert: Option<String>,
    #[clap(long, value_name = "PEM")]
    pub tls_key: Option<String>,
    #[clap(long, default_value_t = false)]
    pub connection_sharing: bool,
    #[clap(long, value_name = "MILLIS", default_value_t = 1000)]
    pub connection_sharing_delay_ms: u64,
    #[clap(long, value_name = "SECONDS", default_value_t = 7)]
    pub connect_retry_timeout_secs: u64,
    #[clap(long, value_name = "COUNT", default_value_t = 64)]
    pub max_idle_server_connections: usize,
    #[clap(long, value_name = "SECONDS", default_value_t = 300)]
    pub pool_idle_timeout_secs: u64,
    #[clap(long, default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, default_value_t = false)]
    pub enable_rest: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl RouterServerArgs {
    pub fn route_config(&self) -> Result<RouteConfig, String> {
        let destinations = self
            .destinations
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(BackendInstance::new)
            .collect_vec();
        if destinations.is_empty() {
            return Err("at least one destination is required".to_string());
        }

        Ok(RouteConfig {
            name: self.route_name.clone(),
            bind_addr: format!("0.0.0.0:{}", self.port),
            destinations,
            strategy: RoutingStrategy::from_str(&self.routing_strategy)?,
            client_ssl_mode: ClientSslMode::from_str(&self.client_ssl_mode)?,
            server_ssl_mode: ServerSslMode::from_str(&self.server_ssl_mode)?,
            tls_cert_path: self.tls_cert.clone(),
            tls_key_path: self.tls_key.clone(),
            connection_sharing: self.connection_sharing,
            connection_sharing_delay: Duration::from_millis(self.connection_sharing_delay_ms),
            connect_retry_timeout: Duration::from_secs(self.connect_retry_timeout_secs),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_server_connections: self.max_idle_server_connections,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_to_route_config() {
        let args = RouterServerArgs {
            destinations: "db-1:3306, db-2:3306".to_string(),
            routing_strategy: "round-robin".to_string(),
            client_ssl_mode: "preferred".to_string(),
            server_ssl_mode: "as_client".to_string(),
            ..RouterServerArgs::default()
        };
        let route = args.route_config().unwrap();
        assert_eq!(route.destinations.len(), 2);
        assert_eq!(route.destinations[1].addr, "db-2:3306");
        assert_eq!(route.strategy, RoutingStrategy::RoundRobin);
    }

    #[test]
    fn empty_destinations_rejected() {
        let args = RouterServerArgs {
            destinations: " ".to_string(),
            routing_strategy: "round-robin".to_string(),
            client_ssl_mode: "disabled".to_string(),
            server_ssl_mode: "disabled".to_string(),
            ..RouterServerArgs::default()
        };
        assert!(args.route_config().is_err());
    }
}
