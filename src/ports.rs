//! Port exposure ledger
//!
//! Process-wide record of which host ports are currently opened for which
//! protocol. The ledger mirrors the port bindings of managed containers 1:1:
//! ports are opened when a container's bindings are reconciled and closed when
//! its container is removed. It carries no other state.

use crate::error::{BerthError, Result};
use crate::runtime::Protocol;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Ledger of externally exposed host ports
pub struct PortLedger {
    /// Currently open (host_port, protocol) pairs
    open: Arc<RwLock<HashSet<(u16, Protocol)>>>,
}

impl PortLedger {
    /// Create a new empty ledger
    pub fn new() -> Self {
        Self {
            open: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Mark a host port as exposed. Idempotent: opening an already-open port
    /// is a no-op. Returns whether the port was newly opened.
    pub fn open(&self, host_port: u16, protocol: Protocol) -> Result<bool> {
        let mut open = self
            .open
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let newly_opened = open.insert((host_port, protocol));
        if newly_opened {
            tracing::info!("Opening host port {}/{}", host_port, protocol);
        } else {
            tracing::debug!("Host port {}/{} already open", host_port, protocol);
        }

        Ok(newly_opened)
    }

    /// Reverse `open`. Idempotent: closing an unopened port is a no-op.
    /// Returns whether the port was actually closed.
    pub fn close(&self, host_port: u16, protocol: Protocol) -> Result<bool> {
        let mut open = self
            .open
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let closed = open.remove(&(host_port, protocol));
        if closed {
            tracing::info!("Closing host port {}/{}", host_port, protocol);
        } else {
            tracing::debug!("Host port {}/{} was not open", host_port, protocol);
        }

        Ok(closed)
    }

    /// Check whether a host port is currently open
    pub fn is_open(&self, host_port: u16, protocol: Protocol) -> Result<bool> {
        let open = self
            .open
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(open.contains(&(host_port, protocol)))
    }

    /// Get all currently open ports
    pub fn open_ports(&self) -> Result<Vec<(u16, Protocol)>> {
        let open = self
            .open
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        let mut ports: Vec<(u16, Protocol)> = open.iter().copied().collect();
        ports.sort();
        Ok(ports)
    }

    /// Number of open ports
    pub fn count(&self) -> Result<usize> {
        let open = self
            .open
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(open.len())
    }
}

impl Default for PortLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PortLedger {
    fn clone(&self) -> Self {
        Self {
            open: Arc::clone(&self.open),
        }
    }
}
