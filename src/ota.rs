//! OTA update coordination.
//!
//! On a trigger the coordinator powers the BLE side down, runs the updater,
//! powers BLE back up and publishes `success` or `failure` to the topic the
//! trigger arrived on. While the updater runs, inbound bus traffic is still
//! drained: further triggers are dropped and everything else is handed back
//! to the caller once the update is over.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::ble::gatt::GattClient;
use crate::ble::radio::RadioDriver;
use crate::bus::client::{BusConnector, InboundMessage};
use crate::bus::router::{CommandRouter, OtaRequest};
use crate::bus::session::BusSessionManager;
use crate::error::{Error, Result};

/// Published when the update installed new firmware.
pub const OTA_SUCCESS: &str = "success";
/// Published when there was no update or it failed.
pub const OTA_FAILURE: &str = "failure";

/// Downloads and installs firmware.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Updater: Send {
    /// Install an update if one is available.
    ///
    /// Returns `true` if new firmware was installed. Any failure is `false`.
    async fn download_and_install_if_available(&mut self) -> bool;
}

/// Updater that runs an external program.
///
/// Exit status 0 means an update was installed.
#[derive(Debug, Clone)]
pub struct CommandUpdater {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandUpdater {
    /// Create an updater for `program`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self) -> Result<bool> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Updater exited with {}", status);
                Ok(status.success())
            }
            Err(_) => Err(Error::Ota {
                reason: format!("updater timed out after {}s", self.timeout.as_secs()),
            }),
        }
    }
}

#[async_trait]
impl Updater for CommandUpdater {
    async fn download_and_install_if_available(&mut self) -> bool {
        match self.run().await {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Update failed: {}", e);
                false
            }
        }
    }
}

/// What happened during one update.
#[derive(Debug, Default)]
pub struct OtaOutcome {
    /// Whether new firmware was installed.
    pub installed: bool,
    /// Whether the result was published.
    pub reported: bool,
    /// Triggers that arrived during the update and were dropped.
    pub ignored_triggers: u32,
    /// Other messages that arrived during the update, in arrival order.
    pub deferred: Vec<InboundMessage>,
}

/// Runs at most one update at a time.
pub struct OtaCoordinator<U> {
    updater: U,
    in_progress: bool,
    completed: u64,
}

impl<U: Updater> OtaCoordinator<U> {
    /// Create a coordinator around `updater`.
    pub fn new(updater: U) -> Self {
        Self {
            updater,
            in_progress: false,
            completed: 0,
        }
    }

    /// Check if an update is running.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Number of updates run to completion.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Run an update for `request`.
    ///
    /// Returns `None` if an update is already in progress.
    pub async fn handle_trigger<R, C>(
        &mut self,
        request: OtaRequest,
        gatt: &mut GattClient,
        radio: &mut R,
        bus: &mut BusSessionManager<C>,
        router: &CommandRouter,
    ) -> Option<OtaOutcome>
    where
        R: RadioDriver,
        C: BusConnector,
    {
        if self.in_progress {
            warn!("OTA already in progress, ignoring trigger on {}", request.topic);
            return None;
        }

        info!("OTA triggered on {}", request.topic);
        self.in_progress = true;
        let mut outcome = OtaOutcome::default();

        gatt.quiesce(radio);

        {
            let update = self.updater.download_and_install_if_available();
            tokio::pin!(update);

            outcome.installed = loop {
                if !bus.is_connected() {
                    break (&mut update).await;
                }

                tokio::select! {
                    installed = &mut update => break installed,
                    inbound = bus.poll_inbound() => match inbound {
                        Ok(Some(message)) if router.is_ota_trigger(&message) => {
                            warn!("OTA already in progress, ignoring trigger");
                            outcome.ignored_triggers += 1;
                        }
                        Ok(Some(message)) => outcome.deferred.push(message),
                        Ok(None) => {}
                        Err(e) => warn!("Bus error during OTA: {}", e),
                    },
                }
            };
        }

        if let Err(e) = gatt.resume(radio) {
            error!("Failed to resume BLE after OTA: {}", e);
        }

        let result = if outcome.installed {
            OTA_SUCCESS
        } else {
            OTA_FAILURE
        };
        info!("OTA finished: {}", result);

        match bus.publish(&request.topic, result.as_bytes()).await {
            Ok(()) => outcome.reported = true,
            Err(e) => warn!("Could not report OTA result: {}", e),
        }

        self.in_progress = false;
        self.completed += 1;
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{GattSettings, GattState};
    use crate::ble::radio::RadioCommand;
    use crate::bus::router::Command;
    use crate::test_support::{session_settings, target_address, FakeBroker, RecordingRadio};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    /// Updater that takes a while and then reports no update.
    struct SlowUpdater {
        delay: Duration,
        calls: u32,
    }

    #[async_trait]
    impl Updater for SlowUpdater {
        async fn download_and_install_if_available(&mut self) -> bool {
            self.calls += 1;
            tokio::time::sleep(self.delay).await;
            false
        }
    }

    fn request() -> OtaRequest {
        OtaRequest {
            topic: "bridge/ota".to_string(),
            token: Bytes::from_static(b"now"),
        }
    }

    fn router() -> CommandRouter {
        CommandRouter::new(session_settings().control_topics)
    }

    #[tokio::test]
    async fn test_failed_update_reports_failure_and_resumes() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), session_settings());
        bus.connect().await.unwrap();

        let mut gatt = GattClient::new(GattSettings::default());
        let mut radio = RecordingRadio::default();
        gatt.start_scan(target_address(), Instant::now(), &mut radio).unwrap();
        radio.take();

        let mut updater = MockUpdater::new();
        updater
            .expect_download_and_install_if_available()
            .times(1)
            .returning(|| false);
        let mut ota = OtaCoordinator::new(updater);

        let outcome = ota
            .handle_trigger(request(), &mut gatt, &mut radio, &mut bus, &router())
            .await
            .unwrap();

        assert!(!outcome.installed);
        assert!(outcome.reported);
        assert_eq!(broker.published_to("bridge/ota"), vec![Bytes::from_static(b"failure")]);
        assert_eq!(
            radio.take(),
            vec![
                RadioCommand::StopScan,
                RadioCommand::SetActive(false),
                RadioCommand::SetActive(true),
            ]
        );
        assert!(radio.active);
        assert_eq!(gatt.state(), GattState::Idle);
        assert!(!ota.in_progress());
    }

    #[tokio::test]
    async fn test_successful_update_reports_success() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), session_settings());
        bus.connect().await.unwrap();

        let mut updater = MockUpdater::new();
        updater
            .expect_download_and_install_if_available()
            .times(1)
            .returning(|| true);
        let mut ota = OtaCoordinator::new(updater);

        let outcome = ota
            .handle_trigger(
                request(),
                &mut GattClient::new(GattSettings::default()),
                &mut RecordingRadio::default(),
                &mut bus,
                &router(),
            )
            .await
            .unwrap();

        assert!(outcome.installed);
        assert_eq!(broker.published_to("bridge/ota"), vec![Bytes::from_static(b"success")]);
        assert_eq!(ota.completed(), 1);
    }

    #[tokio::test]
    async fn test_triggers_during_update_are_ignored() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), session_settings());
        bus.connect().await.unwrap();

        broker.deliver("bridge/ota", "now");
        broker.deliver("bridge/debug", "ping");
        broker.deliver("bridge/ota", "now");

        let mut ota = OtaCoordinator::new(SlowUpdater {
            delay: Duration::from_millis(100),
            calls: 0,
        });
        let outcome = ota
            .handle_trigger(
                request(),
                &mut GattClient::new(GattSettings::default()),
                &mut RecordingRadio::default(),
                &mut bus,
                &router(),
            )
            .await
            .unwrap();

        assert_eq!(ota.updater.calls, 1);
        assert_eq!(outcome.ignored_triggers, 2);
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(router().route(&outcome.deferred[0]), Some(Command::Ping));
        assert_eq!(broker.published_to("bridge/ota").len(), 1);
    }

    #[tokio::test]
    async fn test_result_not_reported_without_bus() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), session_settings());

        let mut updater = MockUpdater::new();
        updater
            .expect_download_and_install_if_available()
            .returning(|| false);
        let mut ota = OtaCoordinator::new(updater);

        let outcome = ota
            .handle_trigger(
                request(),
                &mut GattClient::new(GattSettings::default()),
                &mut RecordingRadio::default(),
                &mut bus,
                &router(),
            )
            .await
            .unwrap();

        assert!(!outcome.reported);
        assert!(broker.published().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_updater_exit_status() {
        let mut ok = CommandUpdater::new("true", Vec::new(), Duration::from_secs(5));
        assert!(ok.download_and_install_if_available().await);

        let mut failing = CommandUpdater::new("false", Vec::new(), Duration::from_secs(5));
        assert!(!failing.download_and_install_if_available().await);

        let mut missing =
            CommandUpdater::new("/nonexistent/updater", Vec::new(), Duration::from_secs(5));
        assert!(!missing.download_and_install_if_available().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_updater_timeout() {
        let mut slow = CommandUpdater::new(
            "sleep",
            vec!["5".to_string()],
            Duration::from_millis(50),
        );
        assert!(!slow.download_and_install_if_available().await);
    }
}
