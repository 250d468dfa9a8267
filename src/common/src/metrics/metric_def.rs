pub const ROUTE_ACTIVE_CONN: &str = "router_route_active_connections";
pub const ROUTE_CLIENT_CONN_TOTAL: &str = "router_route_client_connections_total";
pub const POOL_IDLE_CONN: &str = "router_pool_idle_server_connections";
pub const POOL_STASHED_CONN: &str = "router_pool_stashed_server_connections";
pub const BACKEND_RECONNECT_TOTAL: &str = "router_backend_reconnects_total";
pub const ROUTER_COM_LATENCY: &str = "router_com_latency";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { RouteActiveConnections, route_active_connections, MetricType::Gauge, ROUTE_ACTIVE_CONN, "The number of client connections currently attached to a route."},
    { RouteClientConnectionsTotal, route_client_connections_total, MetricType::Counter, ROUTE_CLIENT_CONN_TOTAL, "Total number of client connections accepted by a route."},
    { PoolIdleConnections, pool_idle_connections, MetricType::Gauge, POOL_IDLE_CONN, "Idle server connections held in the shared connection pool."},
    { PoolStashedConnections, pool_stashed_connections, MetricType::Gauge, POOL_STASHED_CONN, "Server connections stashed for client affinity."},
    { BackendReconnectsTotal, backend_reconnects_total, MetricType::Counter, BACKEND_RECONNECT_TOTAL, "Total number of automatic backend reconnects."},
    { RouterComLatency, com_latency, MetricType::Histogram, ROUTER_COM_LATENCY, "Latency of command execution."}
);
