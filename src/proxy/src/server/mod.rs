use mysql_common::constants::CapabilityFlags;
use std::sync::OnceLock;

pub mod auth;
pub mod forwarder;
pub mod route_config;
pub mod router_server;
pub mod trace;

/// Version string the router announces to clients until it has seen a real
/// backend.
pub const DEFAULT_ROUTER_VERSION: &[u8] = b"8.0.36-router";

pub static DEFAULT_CAPABILITIES_ONCE: OnceLock<CapabilityFlags> = OnceLock::new();

/// Capabilities the router itself speaks on either side of a terminated
/// connection. Compression is negotiated separately per route.
pub fn default_capabilities() -> CapabilityFlags {
    *DEFAULT_CAPABILITIES_ONCE.get_or_init(|| {
        CapabilityFlags::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_FOUND_ROWS
            | CapabilityFlags::CLIENT_IGNORE_SIGPIPE
            | CapabilityFlags::CLIENT_IGNORE_SPACE
            | CapabilityFlags::CLIENT_INTERACTIVE
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
            | CapabilityFlags::CLIENT_REMEMBER_OPTIONS
            | CapabilityFlags::CLIENT_RESERVED
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_TRANSACTIONS
    })
}

/// Phases a client↔router↔server triple moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    AcceptingClient,
    AwaitingClientTls,
    AwaitingClientAuthResponse,
    AcquiringBackend,
    AwaitingBackendAuthResponse,
    Ready,
    ForwardingCommand,
    Parked,
    Reconnecting,
    Error,
}
