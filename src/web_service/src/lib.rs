pub mod http_handler;
pub mod http_server;
pub mod proxy_handler;
