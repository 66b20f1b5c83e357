use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::handler::AgentHandler;
use crate::mqtt::{MqttPublisher, Qos};
use crate::platform::SystemInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("another update is already in progress")]
    AlreadyInProgress,
    #[error("content length missing from firmware source")]
    MissingContentLength,
    #[error("firmware image is empty")]
    EmptyImage,
    #[error("no OTA-capable partition available")]
    NoUpdatePartition,
    #[error("download failed: {0}")]
    Download(String),
    #[error("flash begin failed: {0}")]
    FlashBegin(String),
    #[error("flash write failed: {0}")]
    FlashWrite(String),
    #[error("flash finalize failed: {0}")]
    FlashFinalize(String),
    #[error("set boot partition failed: {0}")]
    SetBoot(String),
    #[error("received {got} bytes, expected {expected}")]
    LengthMismatch { got: u64, expected: u64 },
}

/// A flash region able to hold one firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub offset: u64,
}

/// Streamed firmware download. Content length must be known before the
/// first chunk or the session fails.
pub trait FirmwareStream: Send {
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the image, `None` once the transfer is drained.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, OtaError>> + Send;
}

pub trait FirmwareSource: Send + Sync {
    type Stream: FirmwareStream;

    fn open(
        &self,
        url: &str,
        cert_pem: Option<&str>,
    ) -> impl Future<Output = Result<Self::Stream, OtaError>> + Send;
}

pub trait FlashWriter: Send {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError>;
    fn finalize(self) -> Result<(), OtaError>;
}

/// Partition bookkeeping: pick the next free OTA slot, open a sized
/// write handle into it, and flip the boot target once written.
pub trait FlashPartitions: Send + Sync {
    type Writer: FlashWriter;

    fn next_update_partition(&self) -> Result<Partition, OtaError>;
    fn begin(&self, partition: &Partition, size: u64) -> Result<Self::Writer, OtaError>;
    fn set_boot_partition(&self, partition: &Partition) -> Result<(), OtaError>;
}

#[derive(Debug, Clone)]
pub struct OtaSettings {
    pub url: String,
    pub cert_pem: Option<String>,
    /// Full wire topic carrying status and progress strings.
    pub status_topic: String,
    /// Pause between the terminal status publish and the restart, so the
    /// message can flush.
    pub reboot_grace: Duration,
}

/// Single-slot update driver. At most one session exists at any time,
/// enforced with a non-blocking lock acquisition so a second command is
/// rejected instead of queued.
pub struct OtaManager<M, F, P, S, H> {
    inner: Arc<Inner<M, F, P, S, H>>,
}

impl<M, F, P, S, H> Clone for OtaManager<M, F, P, S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<M, F, P, S, H> {
    mqtt: M,
    source: F,
    flash: P,
    system: Arc<S>,
    handler: Arc<H>,
    settings: OtaSettings,
    slot: Arc<Mutex<()>>,
}

impl<M, F, P, S, H> OtaManager<M, F, P, S, H>
where
    M: MqttPublisher + Send + Sync + 'static,
    F: FirmwareSource + 'static,
    P: FlashPartitions + 'static,
    S: SystemInfo + 'static,
    H: AgentHandler + 'static,
{
    pub fn new(
        mqtt: M,
        source: F,
        flash: P,
        system: Arc<S>,
        handler: Arc<H>,
        settings: OtaSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mqtt,
                source,
                flash,
                system,
                handler,
                settings,
                slot: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Accepts the update command and spawns the session task, or
    /// rejects it when a session already holds the slot.
    pub async fn start(&self) -> Result<JoinHandle<()>, OtaError> {
        let guard = match self.inner.slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("update rejected, another session is running");
                self.inner.publish_status("already in progress").await;
                return Err(OtaError::AlreadyInProgress);
            }
        };

        info!("starting firmware update from {}", self.inner.settings.url);
        self.inner.publish_status("running").await;

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            if let Err(err) = inner.run_session().await {
                warn!("firmware update failed: {err}");
                inner.publish_status(&format!("error: {err}")).await;
            }
            // Releasing the guard makes a new attempt possible.
            drop(guard);
        }))
    }
}

impl<M, F, P, S, H> Inner<M, F, P, S, H>
where
    M: MqttPublisher,
    F: FirmwareSource,
    P: FlashPartitions,
    S: SystemInfo,
    H: AgentHandler,
{
    async fn run_session(&self) -> Result<(), OtaError> {
        let mut stream = self
            .source
            .open(&self.settings.url, self.settings.cert_pem.as_deref())
            .await?;

        let total = stream
            .content_length()
            .ok_or(OtaError::MissingContentLength)?;
        if total == 0 {
            return Err(OtaError::EmptyImage);
        }

        let partition = self.flash.next_update_partition()?;
        info!(
            "writing {total} bytes to partition {} at offset {:#x}",
            partition.label, partition.offset
        );
        let mut writer = self.flash.begin(&partition, total)?;

        let mut done: u64 = 0;
        while done < total {
            let Some(chunk) = stream.next_chunk().await? else {
                break;
            };
            if chunk.is_empty() {
                continue;
            }

            writer.write(&chunk)?;
            done += chunk.len() as u64;

            self.publish_status(&format!("{done}/{total}")).await;
            let percent = (done.saturating_mul(100) / total).min(100) as u8;
            self.handler.ota_progress(percent);
        }

        if done != total {
            return Err(OtaError::LengthMismatch {
                got: done,
                expected: total,
            });
        }

        writer.finalize()?;
        self.flash.set_boot_partition(&partition)?;

        info!("firmware written, restarting into partition {}", partition.label);
        self.publish_status("rebooting").await;
        tokio::time::sleep(self.settings.reboot_grace).await;
        self.system.restart();
        Ok(())
    }

    /// Status is best-effort: a rejected publish never aborts a session.
    async fn publish_status(&self, status: &str) {
        if let Err(err) = self
            .mqtt
            .publish(
                &self.settings.status_topic,
                Qos::AtLeastOnce,
                false,
                status.as_bytes(),
            )
            .await
        {
            warn!("update status publish failed: {err}");
        }
    }
}
