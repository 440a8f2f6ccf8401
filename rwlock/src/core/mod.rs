use std::ffi::{CStr, CString};
use std::fmt;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::errors::{Result, RwLockError};

/// Longest name accepted. Linux stores semaphores as `/dev/shm/sem.<name>`,
/// so the `sem.` prefix eats into `NAME_MAX`.
pub const MAX_NAME_LEN: usize = 255 - 4;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Name shared by the semaphore and the shared memory segment of one lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcName {
    c_name: CString,
}

impl IpcName {
    pub fn new(name: &str) -> Result<IpcName> {
        let normalized = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        };
        let rest = &normalized[1..];
        if rest.is_empty() || rest.contains('/') || rest.len() > MAX_NAME_LEN {
            return Err(RwLockError::InvalidName(name.to_string()));
        }
        if rest.contains('\0') {
            return Err(RwLockError::InvalidName(name.to_string()));
        }
        Ok(IpcName {
            c_name: CString::new(normalized)?,
        })
    }

    #[inline]
    pub fn as_c_str(&self) -> &CStr {
        &self.c_name
    }

    pub fn as_str(&self) -> &str {
        // Built from a &str, so always valid UTF-8.
        self.c_name.to_str().unwrap_or_default()
    }
}

impl fmt::Display for IpcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RwLockConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: Option<u64>,
    pub unlink_on_drop: bool,
}

impl Default for RwLockConfig {
    fn default() -> Self {
        RwLockConfig {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: None,
            unlink_on_drop: false,
        }
    }
}

impl RwLockConfig {
    pub fn builder() -> RwLockConfigBuilder {
        RwLockConfigBuilder::default()
    }

    /// Never zero, polling must not spin.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Default)]
pub struct RwLockConfigBuilder {
    cfg: RwLockConfig,
}

impl RwLockConfigBuilder {
    pub fn poll_interval_ms(mut self, v: u64) -> Self {
        self.cfg.poll_interval_ms = v;
        self
    }

    pub fn timeout_ms(mut self, v: Option<u64>) -> Self {
        self.cfg.timeout_ms = v;
        self
    }

    pub fn unlink_on_drop(mut self, v: bool) -> Self {
        self.cfg.unlink_on_drop = v;
        self
    }

    pub fn build(self) -> RwLockConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_gets_leading_slash() -> Result<()> {
        let name = IpcName::new("locktest")?;
        assert_eq!(name.as_str(), "/locktest");
        assert_eq!(name, IpcName::new("/locktest")?);
        Ok(())
    }

    #[test]
    fn invalid_names() {
        for bad in &["", "/", "a/b", "/a/b", "nul\0name"] {
            match IpcName::new(bad) {
                Err(RwLockError::InvalidName(_)) => {}
                other => panic!("{:?} accepted: {:?}", bad, other),
            }
        }
        let too_long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(IpcName::new(&too_long).is_err());
        assert!(IpcName::new(&too_long[1..]).is_ok());
    }

    #[test]
    fn default_config_polls_every_second_without_deadline() {
        let cfg = RwLockConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.timeout(), None);
        assert!(!cfg.unlink_on_drop);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = RwLockConfig::builder().poll_interval_ms(0).build();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1));
    }
}
