//! Serialized access to backend connections shared across tasks.
//!
//! Neither the DuckDB nor the MySQL connection may be driven by two callers
//! at once. Each registered connection gets its own mutex; callers hold an
//! opaque [`Ticket`] and run their statements through
//! [`ConnectionGate::execute`], which keeps the whole statement + fetch
//! sequence inside one critical section. Different connections never share
//! a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;
use tokio::sync::Mutex;

use crate::error::{Result, VaultError};

/// Tickets are unique across every gate in the process.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Opaque handle binding one connection to a [`ConnectionGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connection that can be parked behind a gate.
#[async_trait]
pub trait GatedConnection: Send + 'static {
    /// Flush durable writes.
    async fn commit(&mut self) -> Result<()>;

    async fn close(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

type Slot<C> = Arc<Mutex<Option<C>>>;

pub struct ConnectionGate<C> {
    slots: RwLock<HashMap<Ticket, Slot<C>>>,
}

impl<C: GatedConnection> ConnectionGate<C> {
    pub fn new() -> Self {
        ConnectionGate {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Take ownership of `connection` and hand back its ticket.
    pub fn register(&self, connection: C) -> Ticket {
        let ticket = Ticket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed));
        self.slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ticket, Arc::new(Mutex::new(Some(connection))));
        debug!("Registered connection ticket {}", ticket);
        ticket
    }

    pub fn is_registered(&self, ticket: Ticket) -> bool {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&ticket)
    }

    fn slot(&self, ticket: Ticket) -> Result<Slot<C>> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&ticket)
            .cloned()
            .ok_or_else(|| missing(ticket))
    }

    /// Run `op` against the ticket's connection while holding its lock.
    ///
    /// Everything `op` does, awaits included, completes before any other
    /// caller touches the same connection.
    pub async fn execute<T, F>(&self, ticket: Ticket, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let slot = self.slot(ticket)?;
        let mut guard = slot.lock().await;
        let connection = guard.as_mut().ok_or_else(|| missing(ticket))?;
        op(connection).await
    }

    pub async fn commit(&self, ticket: Ticket) -> Result<()> {
        let slot = self.slot(ticket)?;
        let mut guard = slot.lock().await;
        guard.as_mut().ok_or_else(|| missing(ticket))?.commit().await
    }

    /// Unregister the ticket and close its connection once in-flight work
    /// on it has finished.
    pub async fn release(&self, ticket: Ticket) -> Result<()> {
        let slot = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&ticket)
            .ok_or_else(|| missing(ticket))?;
        let connection = slot.lock().await.take();
        debug!("Released connection ticket {}", ticket);
        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

impl<C: GatedConnection> Default for ConnectionGate<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(ticket: Ticket) -> VaultError {
    VaultError::MissingTicket(format!("ticket {} is not registered", ticket))
}
