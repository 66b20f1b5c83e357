use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use homie_common::topics::{
    HOMIE_VERSION, SUBTOPIC_HOMIE, SUBTOPIC_LOGGING, SUBTOPIC_NAME, SUBTOPIC_NODES,
    SUBTOPIC_OTA_SET, SUBTOPIC_REBOOT_SET, SUBTOPIC_STATE,
};
use homie_common::types::{mac_display, DeviceState};
use homie_common::{Datatype, DeviceIdentity, Node, NodeRegistry, Property, TopicError, TopicNamespace};

use crate::mqtt::{MqttError, MqttPublisher, Qos};
use crate::platform::SystemInfo;

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Mqtt(#[from] MqttError),
}

/// Builds the built-in `device` node. The OTA and reboot controls are
/// part of the node only when the corresponding feature is enabled, so
/// `$properties` always matches the descriptors actually published.
pub fn device_node<S: SystemInfo>(system: &S, ota_enabled: bool, reboot_enabled: bool) -> Node {
    let mut node = Node::new("device", "Device", system.implementation())
        .property(Property::new("uptime", "Uptime", Datatype::Integer))
        .property(Property::new("rssi", "RSSI", Datatype::Integer))
        .property(Property::new("signal", "Signal", Datatype::Integer))
        .property(Property::new("freeheap", "Free heap", Datatype::Integer))
        .property(Property::new("mac", "MAC address", Datatype::String))
        .property(Property::new("ip", "IP address", Datatype::String))
        .property(Property::new("sdk", "SDK version", Datatype::String))
        .property(Property::new("fwname", "Firmware name", Datatype::String))
        .property(Property::new("fwversion", "Firmware version", Datatype::String));

    if ota_enabled {
        node = node.property(Property::new("ota", "OTA trigger", Datatype::Enum).settable("run"));
    }
    if reboot_enabled {
        node = node.property(Property::new("reboot", "Reboot", Datatype::Enum).settable("reboot"));
    }
    node
}

/// Publishes the full retained attribute set after each fresh connect.
///
/// The sequence is fail-fast: the first rejected publish aborts the rest
/// and the caller leaves the status-update flag set, so the next
/// telemetry tick retries from the top. Every step is a retained
/// overwrite, which is what makes the retry idempotent.
pub struct Announcer<M, S> {
    ns: TopicNamespace,
    identity: DeviceIdentity,
    registry: NodeRegistry,
    ota_enabled: bool,
    reboot_enabled: bool,
    mqtt: M,
    system: Arc<S>,
}

impl<M, S> Announcer<M, S>
where
    M: MqttPublisher,
    S: SystemInfo,
{
    pub fn new(
        ns: TopicNamespace,
        identity: DeviceIdentity,
        registry: NodeRegistry,
        ota_enabled: bool,
        reboot_enabled: bool,
        mqtt: M,
        system: Arc<S>,
    ) -> Self {
        Self {
            ns,
            identity,
            registry,
            ota_enabled,
            reboot_enabled,
            mqtt,
            system,
        }
    }

    pub async fn announce(&self) -> Result<(), AnnounceError> {
        self.publish(SUBTOPIC_STATE, DeviceState::Init.as_str()).await?;
        self.publish(SUBTOPIC_HOMIE, HOMIE_VERSION).await?;
        self.publish(SUBTOPIC_NAME, &self.identity.device_name).await?;
        self.publish(SUBTOPIC_NODES, &self.registry.node_names()).await?;

        for node in self.registry.nodes() {
            self.publish_node(node).await?;
        }

        // Stale retained commands must be wiped before subscribing, or
        // the broker replays the old command the moment we subscribe.
        self.clear_retained(SUBTOPIC_OTA_SET).await?;
        self.clear_retained(SUBTOPIC_REBOOT_SET).await?;
        self.subscribe_commands().await?;

        self.publish(SUBTOPIC_STATE, DeviceState::Ready.as_str()).await?;
        Ok(())
    }

    async fn publish_node(&self, node: &Node) -> Result<(), AnnounceError> {
        let base = &node.name;
        self.publish(&format!("{base}/$name"), &node.label).await?;
        self.publish(&format!("{base}/$type"), &node.node_type).await?;
        self.publish(&format!("{base}/$properties"), &node.property_names())
            .await?;

        for property in &node.properties {
            let prop = format!("{base}/{}", property.name);
            self.publish(&format!("{prop}/$name"), &property.label).await?;
            self.publish(&format!("{prop}/$datatype"), property.datatype.as_str())
                .await?;
            if property.settable {
                self.publish(&format!("{prop}/$settable"), "true").await?;
                if let Some(format) = &property.format {
                    self.publish(&format!("{prop}/$format"), format).await?;
                }
            }

            if node.name == "device" {
                if let Some(value) = self.device_value(&property.name) {
                    self.publish(&prop, &value).await?;
                }
            }
        }

        // The OTA and reboot value topics still report "disabled" when
        // the control is switched off and has no descriptors.
        if node.name == "device" {
            if !self.ota_enabled {
                self.publish("device/ota", "disabled").await?;
            }
            if !self.reboot_enabled {
                self.publish("device/reboot", "disabled").await?;
            }
        }
        Ok(())
    }

    /// Values known at announce time. Runtime stats (uptime, rssi,
    /// signal, freeheap) are filled in by the telemetry task.
    fn device_value(&self, property: &str) -> Option<String> {
        match property {
            "mac" => Some(mac_display(self.system.mac())),
            "ip" => Some(
                self.system
                    .ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
            ),
            "sdk" => Some(self.system.sdk_version().to_string()),
            "fwname" => Some(self.identity.firmware_name.clone()),
            "fwversion" => Some(self.identity.firmware_version.clone()),
            "ota" => Some("idle".to_string()),
            "reboot" => Some("enabled".to_string()),
            _ => None,
        }
    }

    async fn subscribe_commands(&self) -> Result<(), AnnounceError> {
        if self.reboot_enabled {
            self.mqtt.subscribe(&self.ns.topic(SUBTOPIC_REBOOT_SET)?).await?;
        }
        self.mqtt.subscribe(&self.ns.topic(SUBTOPIC_LOGGING)?).await?;
        if self.ota_enabled {
            // The trailing wildcard also matches the bare set topic, so
            // commands with extra path segments are prefix-matched.
            self.mqtt
                .subscribe(&self.ns.topic(&format!("{SUBTOPIC_OTA_SET}/#"))?)
                .await?;
        }

        for node in self.registry.nodes() {
            if node.name == "device" {
                continue;
            }
            for property in node.properties.iter().filter(|p| p.settable) {
                let subtopic = format!("{}/{}/set", node.name, property.name);
                self.mqtt.subscribe(&self.ns.topic(&subtopic)?).await?;
            }
        }
        Ok(())
    }

    async fn publish(&self, subtopic: &str, payload: &str) -> Result<(), AnnounceError> {
        let topic = self.ns.topic(subtopic)?;
        debug!("announce: {topic} = {payload}");
        self.mqtt
            .publish(&topic, Qos::AtLeastOnce, true, payload.as_bytes())
            .await?;
        Ok(())
    }

    async fn clear_retained(&self, subtopic: &str) -> Result<(), AnnounceError> {
        let topic = self.ns.topic(subtopic)?;
        self.mqtt.publish(&topic, Qos::AtLeastOnce, true, b"").await?;
        Ok(())
    }
}
