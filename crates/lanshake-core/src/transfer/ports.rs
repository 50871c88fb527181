//! Exclusive data-phase port leases.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Error, Result};

/// Hands out listeners on ports from a fixed range, one holder per port.
///
/// A `(0, 0)` range binds OS-assigned ephemeral ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: (u16, u16),
    leased: Arc<Mutex<HashSet<u16>>>,
}

/// A held port; released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Option<Arc<Mutex<HashSet<u16>>>>,
}

impl PortLease {
    /// The leased port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(leased) = &self.leased {
            if let Ok(mut set) = leased.lock() {
                set.remove(&self.port);
            }
        }
    }
}

impl PortAllocator {
    /// Allocator over an inclusive port range.
    #[must_use]
    pub fn new(range: (u16, u16)) -> Self {
        Self {
            range,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Ports currently held.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leased.lock().map_or(0, |set| set.len())
    }

    /// Bind a listener reachable from `peer`'s address family.
    ///
    /// # Errors
    ///
    /// Returns an error when every port in the range is held or unbindable.
    pub async fn bind(&self, peer: IpAddr) -> Result<(TcpListener, PortLease)> {
        let unspecified = match peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        if self.range == (0, 0) {
            let listener = TcpListener::bind(SocketAddr::new(unspecified, 0)).await?;
            let port = listener.local_addr()?.port();
            return Ok((listener, PortLease { port, leased: None }));
        }

        let (start, end) = self.range;
        for port in start..=end {
            if !self.try_reserve(port)? {
                continue;
            }
            match TcpListener::bind(SocketAddr::new(unspecified, port)).await {
                Ok(listener) => {
                    debug!(port, "leased data port");
                    return Ok((
                        listener,
                        PortLease {
                            port,
                            leased: Some(Arc::clone(&self.leased)),
                        },
                    ));
                }
                Err(e) => {
                    debug!(port, error = %e, "data port unavailable");
                    self.release(port);
                }
            }
        }

        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free data port in {start}-{end}"),
        )))
    }

    fn try_reserve(&self, port: u16) -> Result<bool> {
        let mut set = self
            .leased
            .lock()
            .map_err(|_| Error::Internal("port table poisoned".to_string()))?;
        Ok(set.insert(port))
    }

    fn release(&self, port: u16) {
        if let Ok(mut set) = self.leased.lock() {
            set.remove(&port);
        }
    }
}
