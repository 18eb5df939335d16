//! Service discovery for the discovered-TCP transport.
//!
//! Local network discovery itself belongs to the operating system. This
//! module defines the two seams the rest of the crate needs, advertising a
//! listener and resolving a name to `host:port`, plus an in-process directory
//! that satisfies both for tests and single-host setups.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::tcp::{self, TcpOptions};
use crate::transport::{lock, StreamTransport};

/// Service type advertised by discoverable servers.
pub const SERVICE_TYPE: &str = "_runtimeviewer._tcp";

/// A resolved advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: SERVICE_TYPE.to_string(),
            host: host.into(),
            port,
        }
    }
}

/// Publishes a listening endpoint under a service name.
pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, record: ServiceRecord) -> Result<()>;

    /// Remove an advertisement. Unknown names are ignored.
    fn withdraw(&self, name: &str);
}

/// Finds advertised endpoints.
pub trait ServiceBrowser: Send + Sync {
    /// Currently visible services of [`SERVICE_TYPE`].
    fn browse(&self) -> Vec<ServiceRecord>;

    /// Wait up to `timeout` for `name` to appear and return its endpoint.
    fn resolve(&self, name: &str, timeout: Duration) -> Result<ServiceRecord>;
}

/// Process-local service directory.
#[derive(Default)]
pub struct InMemoryServiceDirectory {
    records: Mutex<HashMap<String, ServiceRecord>>,
    changed: Condvar,
}

impl InMemoryServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceAdvertiser for InMemoryServiceDirectory {
    fn advertise(&self, record: ServiceRecord) -> Result<()> {
        info!(name = %record.name, host = %record.host, port = record.port, "advertising service");
        lock(&self.records).insert(record.name.clone(), record);
        self.changed.notify_all();
        Ok(())
    }

    fn withdraw(&self, name: &str) {
        if lock(&self.records).remove(name).is_some() {
            debug!(name, "withdrew service");
        }
    }
}

impl ServiceBrowser for InMemoryServiceDirectory {
    fn browse(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = lock(&self.records)
            .values()
            .filter(|record| record.service_type == SERVICE_TYPE)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    fn resolve(&self, name: &str, timeout: Duration) -> Result<ServiceRecord> {
        let deadline = Instant::now() + timeout;
        let mut records = lock(&self.records);
        loop {
            if let Some(record) = records.get(name) {
                return Ok(record.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ServiceNotFound {
                    name: name.to_string(),
                });
            }
            records = self
                .changed
                .wait_timeout(records, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Resolve `name` through `browser`, then open a TCP connection to it.
pub fn connect(
    browser: &dyn ServiceBrowser,
    name: &str,
    resolve_timeout: Duration,
    options: &TcpOptions,
) -> Result<StreamTransport> {
    let record = browser.resolve(name, resolve_timeout)?;
    debug!(name, host = %record.host, port = record.port, "resolved service");
    tcp::connect(&record.host, record.port, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn resolve_waits_for_advertisement() {
        let directory = Arc::new(InMemoryServiceDirectory::new());
        let publisher = Arc::clone(&directory);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            publisher
                .advertise(ServiceRecord::new("mac", "127.0.0.1", 4242))
                .unwrap();
        });

        let record = directory.resolve("mac", Duration::from_secs(2)).unwrap();
        assert_eq!(record.port, 4242);
        assert_eq!(record.service_type, SERVICE_TYPE);
        handle.join().unwrap();
    }

    #[test]
    fn resolve_times_out() {
        let directory = InMemoryServiceDirectory::new();
        let start = Instant::now();
        let err = directory
            .resolve("nobody", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, TransportError::ServiceNotFound { name } if name == "nobody"));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn withdraw_removes_from_browse() {
        let directory = InMemoryServiceDirectory::new();
        directory
            .advertise(ServiceRecord::new("b", "127.0.0.1", 2))
            .unwrap();
        directory
            .advertise(ServiceRecord::new("a", "127.0.0.1", 1))
            .unwrap();
        let names: Vec<_> = directory.browse().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        directory.withdraw("a");
        directory.withdraw("missing");
        assert_eq!(directory.browse().len(), 1);
    }
}
