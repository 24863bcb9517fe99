use std::io::ErrorKind;
use std::net::SocketAddr;

use kiln_core::BindTarget;
use tokio::net::TcpListener;

/// Listeners held on every address a bind target resolves to.
#[derive(Debug)]
pub struct BindProbe {
    addrs: Vec<SocketAddr>,
    listeners: Vec<TcpListener>,
}

impl BindProbe {
    /// The addresses held, in resolution order.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Releases every listener.
    pub fn release(self) {
        tracing::debug!(addrs = ?self.addrs, "bind probe released");
        drop(self.listeners);
    }
}

/// Reserve `target` by binding a listener on each address it resolves to.
///
/// A name such as `localhost` may resolve to both `::1` and `127.0.0.1`,
/// and the server may pick either family, so every address must be free.
/// The caller releases the probe right before spawning the server, which
/// then binds the same address itself. Another process can still take the
/// port in the moment between the two binds.
pub async fn probe_bind(target: &BindTarget) -> Result<BindProbe, BindError> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    let resolved = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| BindError::HostUnresolvable {
            host: target.host.clone(),
            source: e,
        })?;
    for addr in resolved {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    if addrs.is_empty() {
        return Err(BindError::HostUnresolvable {
            host: target.host.clone(),
            source: std::io::Error::new(ErrorKind::NotFound, "host resolved to no addresses"),
        });
    }

    let mut held = Vec::with_capacity(addrs.len());
    let mut listeners = Vec::with_capacity(addrs.len());
    let mut unassignable = None;
    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                held.push(addr);
                listeners.push(listener);
            }
            // The server cannot bind an address missing from this network
            // namespace either, e.g. `::1` with IPv6 disabled.
            Err(e) if e.kind() == ErrorKind::AddrNotAvailable => {
                tracing::debug!(%addr, error = %e, "address not assignable, skipped");
                unassignable = Some(BindError::NotAssignable { addr });
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "bind probe failed");
                return Err(classify(addr, e));
            }
        }
    }

    if listeners.is_empty() {
        if let Some(error) = unassignable {
            return Err(error);
        }
    }
    tracing::debug!(addrs = ?held, "bind probe succeeded");
    Ok(BindProbe {
        addrs: held,
        listeners,
    })
}

fn classify(addr: SocketAddr, error: std::io::Error) -> BindError {
    match error.kind() {
        ErrorKind::AddrInUse => BindError::InUse { addr },
        ErrorKind::AddrNotAvailable => BindError::NotAssignable { addr },
        ErrorKind::PermissionDenied => BindError::PermissionDenied { addr },
        _ => BindError::Io {
            addr,
            source: error,
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("invalid bind parameters")]
    InvalidTarget(#[source] kiln_core::Error),

    #[error("cannot resolve host {host}")]
    HostUnresolvable {
        host: String,
        source: std::io::Error,
    },

    #[error("address {addr} is already in use")]
    InUse { addr: SocketAddr },

    #[error("address {addr} is not assignable in this network namespace")]
    NotAssignable { addr: SocketAddr },

    #[error("permission denied binding {addr}")]
    PermissionDenied { addr: SocketAddr },

    #[error("failed to bind {addr}")]
    Io {
        addr: SocketAddr,
        source: std::io::Error,
    },
}
