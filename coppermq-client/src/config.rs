use crate::client_error;
use crate::tls::TlsAdaptor;
use anyhow::Result;
use bitflags::bitflags;
use std::time::Duration;

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_TLS_PORT: u16 = 5671;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

bitflags! {
    /// Extra tracing taps on top of the regular log levels.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DebugFlags: u8 {
        /// Trace engine decisions like gate admissions and deferrals.
        const LOGIC = 0b00000001;
        /// Log every decoded inbound frame.
        const FRAME_INPUT = 0b00000010;
        /// Log every outbound frame when it is written.
        const FRAME_OUTPUT = 0b00000100;
    }
}

/// Connection parameters of the client.
///
/// A config holds one or more broker addresses. With more than one address
/// the list is shuffled once and rotated on every reconnect attempt.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub(crate) addresses: Vec<String>,
    pub(crate) port: Option<u16>,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) virtual_host: String,
    pub(crate) tls: Option<TlsAdaptor>,
    /// Idle seconds between outbound heartbeats, 0 disables keepalive.
    pub(crate) keepalive: u64,
    pub(crate) reconnect: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) debug: DebugFlags,
}

impl ConnectionConfig {
    pub fn new(address: &str) -> Self {
        Self {
            addresses: vec![address.to_string()],
            port: None,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            tls: None,
            keepalive: 0,
            reconnect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            debug: DebugFlags::empty(),
        }
    }

    /// Replace the address list with several brokers to rotate over.
    pub fn addresses(mut self, addresses: &[&str]) -> Self {
        self.addresses = addresses.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn tls(mut self, tls: TlsAdaptor) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn keepalive(mut self, seconds: u64) -> Self {
        self.keepalive = seconds;
        self
    }

    pub fn reconnect(mut self, mode: bool) -> Self {
        self.reconnect = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn debug(mut self, flags: DebugFlags) -> Self {
        self.debug = flags;
        self
    }

    pub(crate) fn effective_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.tls.is_some() => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() || self.addresses.iter().any(|a| a.is_empty()) {
            return client_error!(None, 0, "At least one non-empty broker address is required", 0);
        }

        if self.virtual_host.is_empty() {
            return client_error!(None, 0, "Virtual host must not be empty", 0);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_depends_on_tls() {
        let config = ConnectionConfig::new("localhost");

        assert_eq!(5672, config.effective_port());
        assert_eq!(5672, ConnectionConfig::new("localhost").port(5672).effective_port());
        assert_eq!(9999, ConnectionConfig::new("localhost").port(9999).effective_port());
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(ConnectionConfig::new("").validate().is_err());
        assert!(ConnectionConfig::new("localhost").addresses(&[]).validate().is_err());
        assert!(ConnectionConfig::new("localhost").validate().is_ok());
    }
}
