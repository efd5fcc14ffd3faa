//! Platform collaborators: network association, clock sync and restart.
//!
//! The supervisor only talks to the traits. The host implementations below
//! are what the binary wires in when running on a general-purpose OS, where
//! the link layer and the clock are managed by the system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::io::Write as _;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Credentials for one network.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkCredentials {
    /// Network name.
    pub ssid: String,
    /// Network password.
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How hard to try each network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationPolicy {
    /// Attempts per network.
    pub attempts: u32,
    /// Upper bound for one attempt.
    pub attempt_timeout: Duration,
    /// Pause between attempts.
    pub pause: Duration,
}

impl Default for AssociationPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            pause: Duration::from_secs(2),
        }
    }
}

/// Joins a network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkAssociation: Send {
    /// Join the network `ssid`.
    async fn connect(&mut self, ssid: &str, password: &str) -> Result<()>;
}

/// Synchronizes the system clock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClockSync: Send {
    /// Synchronize the clock.
    async fn synchronize(&mut self) -> Result<()>;
}

/// Restarts the device.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceRestart: Send {
    /// Restart. On real hardware this does not return.
    fn restart(&mut self, reason: &str);
}

/// Join the primary network, falling back to the secondary one.
///
/// Returns the SSID that was joined.
pub async fn associate<N: NetworkAssociation + ?Sized>(
    network: &mut N,
    primary: &NetworkCredentials,
    fallback: Option<&NetworkCredentials>,
    policy: &AssociationPolicy,
) -> Result<String> {
    for credentials in std::iter::once(primary).chain(fallback) {
        for attempt in 1..=policy.attempts {
            info!(
                "Joining network {} (attempt {}/{})",
                credentials.ssid, attempt, policy.attempts
            );

            let result = tokio::time::timeout(
                policy.attempt_timeout,
                network.connect(&credentials.ssid, &credentials.password),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    info!("Joined network {}", credentials.ssid);
                    return Ok(credentials.ssid.clone());
                }
                Ok(Err(e)) => warn!("Joining {} failed: {}", credentials.ssid, e),
                Err(_) => warn!("Joining {} timed out", credentials.ssid),
            }

            if attempt < policy.attempts {
                tokio::time::sleep(policy.pause).await;
            }
        }
        warn!("Giving up on network {}", credentials.ssid);
    }

    let ssid = fallback.unwrap_or(primary).ssid.clone();
    error!("Could not join any network");
    Err(Error::NetworkAssociation { ssid })
}

/// Network association on a host where the OS owns the link.
///
/// Joining succeeds once the broker host name resolves.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    host: String,
    port: u16,
}

impl HostNetwork {
    /// Check reachability of `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl NetworkAssociation for HostNetwork {
    async fn connect(&mut self, ssid: &str, _password: &str) -> Result<()> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                warn!("Cannot resolve {}: {}", self.host, e);
                Error::NetworkAssociation {
                    ssid: ssid.to_string(),
                }
            })?;

        match addrs.next() {
            Some(addr) => {
                info!("{} resolves to {}", self.host, addr);
                Ok(())
            }
            None => Err(Error::NetworkAssociation {
                ssid: ssid.to_string(),
            }),
        }
    }
}

/// 2024-01-01T00:00:00Z; an unsynchronized clock reads earlier than this.
const EARLIEST_VALID_TIMESTAMP: i64 = 1_704_067_200;

/// Clock check for a host whose clock is set by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create the clock check.
    pub fn new() -> Self {
        Self
    }

    /// Check a time against the lower bound.
    pub fn check(&self, now: DateTime<Utc>) -> Result<()> {
        if now.timestamp() < EARLIEST_VALID_TIMESTAMP {
            return Err(Error::ClockSync {
                reason: format!("clock reads {}, not synchronized", now.to_rfc3339()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClockSync for SystemClock {
    async fn synchronize(&mut self) -> Result<()> {
        self.check(Utc::now())
    }
}

/// Exit status telling the service manager to restart the bridge.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Restarts by exiting the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRestart;

impl DeviceRestart for ProcessRestart {
    fn restart(&mut self, reason: &str) {
        error!("Restarting: {}", reason);
        let _ = std::io::stdout().flush();
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockall::predicate::eq;

    fn credentials(ssid: &str) -> NetworkCredentials {
        NetworkCredentials {
            ssid: ssid.to_string(),
            password: "secret".to_string(),
        }
    }

    fn fast_policy() -> AssociationPolicy {
        AssociationPolicy {
            attempts: 3,
            attempt_timeout: Duration::from_secs(1),
            pause: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_falls_back_after_primary_attempts() {
        let mut network = MockNetworkAssociation::new();
        network
            .expect_connect()
            .with(eq("home"), eq("secret"))
            .times(3)
            .returning(|ssid, _| {
                Err(Error::NetworkAssociation {
                    ssid: ssid.to_string(),
                })
            });
        network
            .expect_connect()
            .with(eq("hotspot"), eq("secret"))
            .times(1)
            .returning(|_, _| Ok(()));

        let joined = associate(
            &mut network,
            &credentials("home"),
            Some(&credentials("hotspot")),
            &fast_policy(),
        )
        .await
        .unwrap();
        assert_eq!(joined, "hotspot");
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let mut network = MockNetworkAssociation::new();
        network
            .expect_connect()
            .with(eq("home"), eq("secret"))
            .times(1)
            .returning(|_, _| Ok(()));

        let joined = associate(
            &mut network,
            &credentials("home"),
            Some(&credentials("hotspot")),
            &fast_policy(),
        )
        .await
        .unwrap();
        assert_eq!(joined, "home");
    }

    #[tokio::test]
    async fn test_no_network_joined() {
        let mut network = MockNetworkAssociation::new();
        network.expect_connect().times(3).returning(|ssid, _| {
            Err(Error::NetworkAssociation {
                ssid: ssid.to_string(),
            })
        });

        let err = associate(&mut network, &credentials("home"), None, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NetworkAssociation { ssid } if ssid == "home"));
    }

    #[test]
    fn test_clock_check() {
        let clock = SystemClock::new();
        let early = Utc.with_ymd_and_hms(1970, 1, 1, 0, 10, 0).unwrap();
        let synced = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert!(matches!(clock.check(early), Err(Error::ClockSync { .. })));
        assert!(clock.check(synced).is_ok());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let text = format!("{:?}", credentials("home"));
        assert!(text.contains("home"));
        assert!(!text.contains("secret"));
    }

    #[tokio::test]
    async fn test_host_network_resolves_localhost() {
        let mut network = HostNetwork::new("localhost", 8883);
        assert!(network.connect("host", "").await.is_ok());
    }
}
