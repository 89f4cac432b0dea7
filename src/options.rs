//! String-keyed transport configuration.
//!
//! A transport is configured through a flat key/value mapping, copied into
//! the transport object at creation time. The builder helpers validate and
//! populate the mapping per address family before transport creation, so a
//! backend can assume well-formed values for the keys it consumes.

use std::collections::HashMap;
use std::fmt;

use crate::error::TransportError;

/// Option key: address family, one of `inet`, `inet6` or `unix`.
pub const ADDRESS_FAMILY: &str = "transport.address-family";
/// Option key: remote host name for outbound connects.
pub const REMOTE_HOST: &str = "remote-host";
/// Option key: remote port for outbound connects.
pub const REMOTE_PORT: &str = "remote-port";
/// Option key: local listen port.
pub const LISTEN_PORT: &str = "transport.listen-port";
/// Option key: filesystem path of a Unix-domain socket.
pub const UNIX_PATH: &str = "transport.socket.connect-path";
/// Option key: seconds before an unanswered frame is timed out.
pub const FRAME_TIMEOUT: &str = "frame-timeout";
/// Option key: keepalive probe interval, seconds.
pub const KEEPALIVE_INTERVAL: &str = "transport.socket.keepalive-interval";
/// Option key: idle time before the first keepalive probe, seconds.
pub const KEEPALIVE_TIME: &str = "transport.socket.keepalive-time";
/// Option key: unacknowledged-data timeout, seconds.
pub const KEEPALIVE_TIMEOUT: &str = "transport.tcp-user-timeout";
/// Option key: cap on submissions awaiting transmission. `0` disables the
/// limit.
pub const OUTSTANDING_RPC_LIMIT: &str = "rpc.outstanding-rpc-limit";
/// Option key: instance name of the transport, defaults to the backend name.
pub const TRANSPORT_NAME: &str = "transport.name";
/// Option key: endpoint name used by the in-process loopback backend.
pub const LOOPBACK_ENDPOINT: &str = "transport.loopback.endpoint";

/// Longest permitted Unix-domain socket path, including the terminator the
/// kernel reserves.
pub const UNIX_PATH_MAX: usize = 108;

/// Outstanding-submission cap applied when the option is absent.
pub const DEFAULT_OUTSTANDING_RPC_LIMIT: u32 = 64;

/// Flat key/value configuration mapping handed to the transport factory.
#[derive(Clone, Default)]
pub struct TransportOptions {
    map: HashMap<String, String>,
}

impl TransportOptions {
    pub fn new() -> TransportOptions {
        TransportOptions::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Reads an integer-valued option, failing with `InvalidOption` when
    /// the value does not parse.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, TransportError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(|_| TransportError::invalid_option(key, format!("not an integer: {raw:?}"))),
        }
    }

    pub fn get_u16(&self, key: &str) -> Result<Option<u16>, TransportError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u16>()
                .map(Some)
                .map_err(|_| TransportError::invalid_option(key, format!("not a port: {raw:?}"))),
        }
    }

    /// The effective outstanding-submission cap, `None` when disabled.
    pub fn outstanding_limit(&self) -> Result<Option<u32>, TransportError> {
        let limit = self
            .get_u32(OUTSTANDING_RPC_LIMIT)?
            .unwrap_or(DEFAULT_OUTSTANDING_RPC_LIMIT);
        Ok(if limit == 0 { None } else { Some(limit) })
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        f.debug_struct("TransportOptions").field("keys", &keys).finish()
    }
}

/// Builds options for an IPv4/IPv6 transport connecting to `hostname:port`.
///
/// Validates the address family before transport creation so backends see
/// only `inet` or `inet6`.
pub fn inet_options(
    hostname: &str,
    port: u16,
    address_family: &str,
) -> Result<TransportOptions, TransportError> {
    match address_family {
        "inet" | "inet6" => {}
        other => {
            return Err(TransportError::invalid_option(
                ADDRESS_FAMILY,
                format!("expected inet or inet6, got {other:?}"),
            ))
        }
    }
    if hostname.is_empty() {
        return Err(TransportError::invalid_option(REMOTE_HOST, "empty host name"));
    }
    let mut options = TransportOptions::new();
    options
        .set(ADDRESS_FAMILY, address_family)
        .set(REMOTE_HOST, hostname)
        .set(REMOTE_PORT, port.to_string());
    Ok(options)
}

/// Builds options for a Unix-domain transport bound to `path`.
pub fn unix_options(
    path: &str,
    frame_timeout: Option<u32>,
) -> Result<TransportOptions, TransportError> {
    if path.is_empty() {
        return Err(TransportError::invalid_option(UNIX_PATH, "empty socket path"));
    }
    if path.len() >= UNIX_PATH_MAX {
        return Err(TransportError::invalid_option(
            UNIX_PATH,
            format!("path longer than {} bytes", UNIX_PATH_MAX - 1),
        ));
    }
    let mut options = TransportOptions::new();
    options.set(ADDRESS_FAMILY, "unix").set(UNIX_PATH, path);
    if let Some(seconds) = frame_timeout {
        options.set(FRAME_TIMEOUT, seconds.to_string());
    }
    Ok(options)
}

/// Populates the TCP keepalive triplet on an existing option set.
pub fn keepalive_options(
    options: &mut TransportOptions,
    interval: u32,
    time: u32,
    timeout: u32,
) {
    options
        .set(KEEPALIVE_INTERVAL, interval.to_string())
        .set(KEEPALIVE_TIME, time.to_string())
        .set(KEEPALIVE_TIMEOUT, timeout.to_string());
}
