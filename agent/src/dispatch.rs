use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use homie_common::topics::{
    LOGGING_ENABLE_TOKEN, OTA_RUN_TOKEN, REBOOT_TOKEN, SUBTOPIC_LOGGING, SUBTOPIC_OTA_SET,
    SUBTOPIC_REBOOT, SUBTOPIC_REBOOT_SET,
};
use homie_common::{TopicError, TopicNamespace};

use crate::handler::AgentHandler;
use crate::logging::RemoteLogSwitch;
use crate::mqtt::{MqttPublisher, Qos};
use crate::ota::{FirmwareSource, FlashPartitions, OtaError, OtaManager};
use crate::platform::SystemInfo;

/// Pause after the reboot acknowledgement so the publish can flush.
const REBOOT_ACK_GRACE: Duration = Duration::from_secs(1);

/// Routes each complete inbound message to the built-in commands or the
/// application handler. Reserved topics always win; the application
/// never sees them, even with an unrecognized payload.
pub struct Dispatcher<M, F, P, S, H> {
    ns: TopicNamespace,
    mqtt: M,
    handler: Arc<H>,
    ota: OtaManager<M, F, P, S, H>,
    remote_log: RemoteLogSwitch,
    system: Arc<S>,
    reboot_enabled: bool,
    ota_enabled: bool,
    reboot_set_topic: String,
    logging_topic: String,
    ota_set_topic: String,
}

impl<M, F, P, S, H> Dispatcher<M, F, P, S, H>
where
    M: MqttPublisher + Send + Sync + 'static,
    F: FirmwareSource + 'static,
    P: FlashPartitions + 'static,
    S: SystemInfo + 'static,
    H: AgentHandler + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ns: TopicNamespace,
        mqtt: M,
        handler: Arc<H>,
        ota: OtaManager<M, F, P, S, H>,
        remote_log: RemoteLogSwitch,
        system: Arc<S>,
        reboot_enabled: bool,
        ota_enabled: bool,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            reboot_set_topic: ns.topic(SUBTOPIC_REBOOT_SET)?,
            logging_topic: ns.topic(SUBTOPIC_LOGGING)?,
            ota_set_topic: ns.topic(SUBTOPIC_OTA_SET)?,
            ns,
            mqtt,
            handler,
            ota,
            remote_log,
            system,
            reboot_enabled,
            ota_enabled,
        })
    }

    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        if topic == self.reboot_set_topic {
            self.handle_reboot(payload).await;
        } else if topic == self.logging_topic {
            self.handle_logging_toggle(payload);
        } else if self.is_ota_command(topic) {
            self.handle_ota(payload).await;
        } else if let Some(subtopic) = self.ns.subtopic(topic) {
            self.handler.handle_command(subtopic, payload).await;
        } else {
            debug!("ignoring message outside namespace: {topic}");
        }
    }

    /// The OTA set topic or anything below it. A bare string prefix is
    /// not enough: the next byte must be a segment boundary, or a topic
    /// like `device/ota/setpoint` would be swallowed as a command.
    fn is_ota_command(&self, topic: &str) -> bool {
        match topic.strip_prefix(self.ota_set_topic.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    async fn handle_reboot(&self, payload: &[u8]) {
        if !self.reboot_enabled {
            info!("reboot command ignored, reboot is disabled");
            return;
        }
        if payload != REBOOT_TOKEN.as_bytes() {
            info!(
                "unrecognized reboot payload: {:?}",
                String::from_utf8_lossy(payload)
            );
            return;
        }

        info!("rebooting on command");
        self.ack_and_clear_reboot().await;
        // The restart waits out the grace period in its own task, so the
        // transport loop keeps flushing and the ack and retained clear
        // actually reach the broker before the process dies.
        let system = self.system.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REBOOT_ACK_GRACE).await;
            system.restart();
        });
    }

    /// Acknowledge, then wipe the retained command so it does not replay
    /// after the restart. Both are best-effort; the reboot proceeds
    /// regardless.
    async fn ack_and_clear_reboot(&self) {
        let ack = self
            .ns
            .topic(SUBTOPIC_REBOOT)
            .map(|topic| (topic, "rebooting"));
        match ack {
            Ok((topic, payload)) => {
                if let Err(err) = self
                    .mqtt
                    .publish(&topic, Qos::AtLeastOnce, true, payload.as_bytes())
                    .await
                {
                    warn!("reboot acknowledgement failed: {err}");
                }
            }
            Err(err) => warn!("reboot acknowledgement failed: {err}"),
        }

        if let Err(err) = self
            .mqtt
            .publish(&self.reboot_set_topic, Qos::AtLeastOnce, true, b"")
            .await
        {
            warn!("clearing retained reboot command failed: {err}");
        }
    }

    fn handle_logging_toggle(&self, payload: &[u8]) {
        if payload == LOGGING_ENABLE_TOKEN.as_bytes() {
            self.remote_log.enable();
            info!("remote logging enabled");
        } else {
            self.remote_log.disable();
            info!("remote logging disabled");
        }
    }

    async fn handle_ota(&self, payload: &[u8]) {
        if !self.ota_enabled {
            info!("update command ignored, OTA is disabled");
            return;
        }
        if payload.is_empty() {
            // Retained-command clears arrive on our own subscription.
            return;
        }
        if payload != OTA_RUN_TOKEN.as_bytes() {
            info!(
                "unrecognized update payload: {:?}",
                String::from_utf8_lossy(payload)
            );
            return;
        }

        match self.ota.start().await {
            Ok(_) => {}
            Err(OtaError::AlreadyInProgress) => {}
            Err(err) => warn!("update could not start: {err}"),
        }
    }
}
