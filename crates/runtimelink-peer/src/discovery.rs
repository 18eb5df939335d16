use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::DiscoveryError;

/// First port of the IANA dynamic/private range.
pub const DYNAMIC_PORT_START: u16 = 49152;
const DYNAMIC_PORT_SPAN: u64 = 65535 - DYNAMIC_PORT_START as u64;

const PORT_FILE_EXTENSION: &str = "port";

/// File-based rendezvous for loopback listeners.
///
/// The listening side writes its bound port to `<directory>/<identifier>.port`;
/// the connecting side polls for that file.
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    directory: PathBuf,
    poll_interval: Duration,
}

impl Default for PortDiscovery {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("runtimelink"))
    }
}

impl PortDiscovery {
    /// Default interval between existence checks in [`PortDiscovery::read`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the port file for `identifier`. Characters outside
    /// `[A-Za-z0-9._-]` are replaced with `_`.
    pub fn path_for(&self, identifier: &str) -> Result<PathBuf, DiscoveryError> {
        let name: String = identifier
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() || name == "." || name == ".." {
            return Err(DiscoveryError::InvalidIdentifier(identifier.to_string()));
        }
        Ok(self
            .directory
            .join(format!("{name}.{PORT_FILE_EXTENSION}")))
    }

    /// Atomically publish `port` for `identifier`, replacing any previous file.
    pub fn write(&self, identifier: &str, port: u16) -> Result<PathBuf, DiscoveryError> {
        let path = self.path_for(identifier)?;
        let io_err = |source| DiscoveryError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.directory).map_err(io_err)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.directory).map_err(io_err)?;
        write!(file, "{port}").map_err(io_err)?;
        file.persist(&path).map_err(|err| io_err(err.error))?;

        info!(identifier, port, path = %path.display(), "wrote port file");
        Ok(path)
    }

    /// Poll for the port file until it exists or `timeout` elapses.
    pub fn read(&self, identifier: &str, timeout: Duration) -> Result<u16, DiscoveryError> {
        let path = self.path_for(identifier)?;
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let port = content.trim().parse::<u16>().map_err(|_| DiscoveryError::Invalid {
                        path: path.clone(),
                        content: content.clone(),
                    })?;
                    debug!(identifier, port, "read port file");
                    return Ok(port);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DiscoveryError::NotFound { path, timeout });
                    }
                    std::thread::sleep(self.poll_interval.min(deadline - now));
                }
                Err(source) => return Err(DiscoveryError::Io { path, source }),
            }
        }
    }

    /// Delete the port file. Missing files are not an error.
    pub fn remove(&self, identifier: &str) {
        let Ok(path) = self.path_for(identifier) else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(identifier, path = %path.display(), "removed port file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!(identifier, error = %err, "could not remove port file"),
        }
    }

    /// Deterministic port in 49152..65535 for `identifier`.
    ///
    /// Lets both sides agree on a port without any shared file, at the cost
    /// of possible collisions. Uses the djb2 string hash.
    pub fn compute_port(identifier: &str) -> u16 {
        let hash = identifier
            .bytes()
            .fold(5381u64, |h, b| h.wrapping_mul(33).wrapping_add(u64::from(b)));
        let port = DYNAMIC_PORT_START + (hash % DYNAMIC_PORT_SPAN) as u16;
        debug!(identifier, port, "computed port");
        port
    }
}
