//! TCP port availability checks
//!
//! A port counts as taken when it is the local end of any TCP connection or
//! has a listener bound to it. Query failures count as taken.

use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Read access to the OS table of TCP sockets
pub trait PortTable: Send + Sync {
    /// Local ports of all active TCP connections and listeners
    fn bound_ports(&self) -> anyhow::Result<Vec<u16>>;
}

/// Port table backed by the operating system's socket list
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortTable;

impl PortTable for SystemPortTable {
    fn bound_ports(&self) -> anyhow::Result<Vec<u16>> {
        let af = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let sockets = get_sockets_info(af, ProtocolFlags::TCP)?;
        Ok(sockets
            .into_iter()
            .filter_map(|socket| match socket.protocol_socket_info {
                ProtocolSocketInfo::Tcp(tcp) => Some(tcp.local_port),
                ProtocolSocketInfo::Udp(_) => None,
            })
            .collect())
    }
}

pub type SharedPortTable = Arc<dyn PortTable>;

/// Polls the port table until a port is free
#[derive(Clone)]
pub struct PortWaiter {
    table: SharedPortTable,
}

impl PortWaiter {
    pub fn new(table: SharedPortTable) -> Self {
        Self { table }
    }

    /// Whether nothing is bound to `port`
    pub fn is_available(&self, port: u16) -> bool {
        match self.table.bound_ports() {
            Ok(ports) => !ports.contains(&port),
            Err(e) => {
                warn!(port, error = %e, "Error checking port availability");
                false
            }
        }
    }

    /// Poll `is_available` up to `max_retries` times, `delay` apart
    ///
    /// Returns as soon as the port is free. No delay follows the last attempt.
    pub async fn wait_until_available(&self, port: u16, max_retries: u32, delay: Duration) -> bool {
        for attempt in 1..=max_retries {
            if self.is_available(port) {
                debug!(port, attempt, "Port is available");
                return true;
            }

            debug!(port, attempt, max_retries, "Port is in use, waiting");
            if attempt < max_retries {
                tokio::time::sleep(delay).await;
            }
        }

        false
    }
}
