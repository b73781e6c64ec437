use std::{io, net::SocketAddr};

use {tokio::net::TcpListener, tracing::info};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another gateway already owns {addr}")]
    Held { addr: String },
    #[error("invalid listen address '{addr}'")]
    InvalidAddress { addr: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Exclusive ownership of the gateway port. Holding the bound listener is the
/// lock; dropping it releases the port.
#[derive(Debug)]
pub struct GatewayLock {
    listener: TcpListener,
    addr: SocketAddr,
}

impl GatewayLock {
    /// Bind `bind:port`. Fails immediately when the port is taken; never
    /// retries on another port.
    pub async fn acquire(bind: &str, port: u16) -> Result<Self, LockError> {
        let raw = format!("{bind}:{port}");
        let requested: SocketAddr = raw
            .parse()
            .or_else(|_| format!("[{bind}]:{port}").parse())
            .map_err(|_| LockError::InvalidAddress { addr: raw.clone() })?;
        let listener = TcpListener::bind(requested).await.map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                LockError::Held { addr: raw.clone() }
            } else {
                LockError::Bind {
                    addr: raw.clone(),
                    source,
                }
            }
        })?;
        let addr = listener.local_addr().map_err(|source| LockError::Bind {
            addr: raw.clone(),
            source,
        })?;
        info!(%addr, "gateway lock acquired");
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}
