//! Outbound connections to backends, with per-backend keep-alive reuse.

use crate::error::GatewayError;
use crate::proxy::backend::Backend;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// An outbound stream and whether it came from the idle set.
pub struct Checkout {
    pub stream: TcpStream,
    pub reused: bool,
}

/// Opens connections to backends and keeps a few idle ones per backend.
pub struct Connector {
    idle: HashMap<String, Mutex<Vec<TcpStream>>>,
    connect_timeout: Duration,
    max_idle: usize,
}

impl Connector {
    /// Prepares idle slots for every backend in `backends`.
    pub fn new<'a>(
        backends: impl IntoIterator<Item = &'a Backend>,
        connect_timeout: Duration,
        max_idle: usize,
    ) -> Self {
        let idle = backends
            .into_iter()
            .map(|b| (b.authority().to_string(), Mutex::new(Vec::new())))
            .collect();

        Self {
            idle,
            connect_timeout,
            max_idle,
        }
    }

    /// Returns an idle connection to `backend` if one is parked, otherwise
    /// opens a new one.
    pub async fn checkout(&self, backend: &Backend) -> Result<Checkout, GatewayError> {
        if let Some(slot) = self.idle.get(backend.authority()) {
            if let Some(stream) = slot.lock().await.pop() {
                return Ok(Checkout {
                    stream,
                    reused: true,
                });
            }
        }

        Ok(Checkout {
            stream: self.connect(backend).await?,
            reused: false,
        })
    }

    /// Opens a fresh connection, bounded by the connect timeout.
    pub async fn connect(&self, backend: &Backend) -> Result<TcpStream, GatewayError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(backend.authority()))
            .await
            .map_err(|_| GatewayError::Timeout(self.connect_timeout))?
            .map_err(GatewayError::Unreachable)?;

        // Requests are written in one go; no point delaying them.
        let _ = stream.set_nodelay(true);

        tracing::trace!(backend = backend.display_name(), "Connected to backend");
        Ok(stream)
    }

    /// Parks a connection whose last exchange left it reusable.
    pub async fn release(&self, backend: &Backend, stream: TcpStream) {
        if let Some(slot) = self.idle.get(backend.authority()) {
            let mut idle = slot.lock().await;
            if idle.len() < self.max_idle {
                idle.push(stream);
            }
        }
    }

    /// Number of parked connections for `backend`.
    pub async fn idle_count(&self, backend: &Backend) -> usize {
        match self.idle.get(backend.authority()) {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }
}
