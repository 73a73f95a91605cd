//! Network drive availability

use crate::clock::Clock;
use crate::config::LocalStoreConfig;
use crate::error::{Result, StationError};
use log::{debug, warn};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// A network share the canonical store lives on
pub trait NetworkMount: Send {
    fn is_mounted(&self) -> bool;

    /// Whether the file server behind the share answers
    fn server_reachable(&self) -> bool {
        true
    }

    /// Ask the OS to mount the share. Success is judged by `is_mounted`.
    fn mount(&mut self) -> Result<()>;
}

/// Share listed in `/etc/fstab`, checked against the `mount` table
#[derive(Debug, Clone)]
pub struct SystemMount {
    mount_point: PathBuf,
    server: Option<String>,
}

impl SystemMount {
    pub fn new<P: Into<PathBuf>>(mount_point: P) -> Self {
        Self {
            mount_point: mount_point.into(),
            server: None,
        }
    }

    /// Ping `server` before every mount attempt
    pub fn with_server(mut self, server: Option<String>) -> Self {
        self.server = server;
        self
    }
}

impl NetworkMount for SystemMount {
    fn is_mounted(&self) -> bool {
        let point = self.mount_point.to_string_lossy();
        match Command::new("mount").output() {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.split_whitespace().nth(2) == Some(point.as_ref())),
            Err(e) => {
                warn!("Could not read mount table: {}", e);
                false
            }
        }
    }

    fn server_reachable(&self) -> bool {
        let Some(host) = &self.server else {
            return true;
        };
        match Command::new("ping")
            .args(["-c", "1", host.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("Could not run ping: {}", e);
                false
            }
        }
    }

    fn mount(&mut self) -> Result<()> {
        let status = Command::new("mount").arg(&self.mount_point).status()?;
        if !status.success() {
            debug!("mount {} exited with {}", self.mount_point.display(), status);
        }
        Ok(())
    }
}

/// Make sure the share is mounted, retrying a fixed number of times
///
/// Returns [`StationError::Connectivity`] once `retries` attempts have
/// failed, `delay` apart.
pub fn ensure_mounted(mount: &mut dyn NetworkMount, retries: u32, delay: Duration, clock: &dyn Clock) -> Result<()> {
    if mount.is_mounted() {
        debug!("Network storage is already available");
        return Ok(());
    }

    for attempt in 1..=retries {
        if let Err(e) = mount.mount() {
            warn!("Mount attempt {} failed: {}", attempt, e);
        }
        if mount.is_mounted() {
            debug!("Network storage mounted after {} attempt(s)", attempt);
            return Ok(());
        }
        warn!("Network storage was not mounted, will try again");
        if attempt < retries {
            clock.sleep(delay);
        }
    }

    Err(StationError::Connectivity(format!(
        "Failed to mount network drive after {} attempts",
        retries
    )))
}

/// Wait until the file server answers, retrying a fixed number of times
pub fn wait_for_server(mount: &dyn NetworkMount, retries: u32, delay: Duration, clock: &dyn Clock) -> Result<()> {
    for attempt in 1..=retries {
        if mount.server_reachable() {
            return Ok(());
        }
        warn!("Connection to file server failed, will try again");
        if attempt < retries {
            clock.sleep(delay);
        }
    }
    Err(StationError::Connectivity(format!(
        "File server unreachable after {} attempts",
        retries
    )))
}

/// Reach the file server, then mount the share, each within its retry budget
///
/// The server is only pinged when the share is not mounted yet.
pub fn connect(mount: &mut dyn NetworkMount, settings: &LocalStoreConfig, clock: &dyn Clock) -> Result<()> {
    if !mount.is_mounted() {
        wait_for_server(mount, settings.server_retries, settings.server_retry_delay, clock)?;
    }
    ensure_mounted(mount, settings.mount_retries, settings.mount_retry_delay, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Local;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mounts on the n-th attempt
    struct FlakyMount {
        attempts: u32,
        succeeds_on: Option<u32>,
    }

    impl NetworkMount for FlakyMount {
        fn is_mounted(&self) -> bool {
            self.succeeds_on.is_some_and(|n| self.attempts >= n)
        }

        fn mount(&mut self) -> Result<()> {
            self.attempts += 1;
            Ok(())
        }
    }

    #[test]
    fn test_already_mounted_skips_mount() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = FlakyMount { attempts: 0, succeeds_on: Some(0) };
        ensure_mounted(&mut mount, 10, Duration::from_secs(2), &clock).unwrap();
        assert_eq!(mount.attempts, 0);
    }

    #[test]
    fn test_mount_after_retries() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = FlakyMount { attempts: 0, succeeds_on: Some(3) };
        ensure_mounted(&mut mount, 10, Duration::from_secs(2), &clock).unwrap();
        assert_eq!(mount.attempts, 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_mount_gives_up() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = FlakyMount { attempts: 0, succeeds_on: None };
        let err = ensure_mounted(&mut mount, 10, Duration::from_secs(2), &clock).unwrap_err();
        assert!(matches!(err, StationError::Connectivity(_)));
        assert_eq!(mount.attempts, 10);
        assert_eq!(clock.elapsed(), Duration::from_secs(18));
    }

    /// Server answers from the n-th ping on; mounting always works
    struct SlowServer {
        pings: AtomicU32,
        answers_on: Option<u32>,
        mounted: bool,
    }

    impl NetworkMount for SlowServer {
        fn is_mounted(&self) -> bool {
            self.mounted
        }

        fn server_reachable(&self) -> bool {
            let pings = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
            self.answers_on.is_some_and(|n| pings >= n)
        }

        fn mount(&mut self) -> Result<()> {
            self.mounted = true;
            Ok(())
        }
    }

    fn local_settings() -> LocalStoreConfig {
        LocalStoreConfig {
            filename: None,
            network_drive: PathBuf::from("/media/vibration"),
            save_location: PathBuf::from("/media/vibration/d"),
            temp_save_location: PathBuf::from("/tmp/pending"),
            mount_retries: 10,
            mount_retry_delay: Duration::from_secs(2),
            server: Some("fileserver".into()),
            server_retries: 10,
            server_retry_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_connect_waits_for_server() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = SlowServer { pings: Default::default(), answers_on: Some(3), mounted: false };
        connect(&mut mount, &local_settings(), &clock).unwrap();
        assert_eq!(mount.pings.load(Ordering::SeqCst), 3);
        assert!(mount.mounted);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_connect_gives_up_on_silent_server() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = SlowServer { pings: Default::default(), answers_on: None, mounted: false };
        let err = connect(&mut mount, &local_settings(), &clock).unwrap_err();
        assert!(matches!(err, StationError::Connectivity(ref msg) if msg.contains("File server")));
        assert_eq!(mount.pings.load(Ordering::SeqCst), 10);
        assert!(!mount.mounted);
        assert_eq!(clock.elapsed(), Duration::from_secs(45));
    }

    #[test]
    fn test_connect_skips_ping_when_mounted() {
        let clock = ManualClock::starting_at(Local::now());
        let mut mount = SlowServer { pings: Default::default(), answers_on: None, mounted: true };
        connect(&mut mount, &local_settings(), &clock).unwrap();
        assert_eq!(mount.pings.load(Ordering::SeqCst), 0);
    }
}
