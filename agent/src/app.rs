use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use homie_common::topics::{SUBTOPIC_LOG, SUBTOPIC_OTA, SUBTOPIC_STATE};
use homie_common::types::DeviceState;
use homie_common::{
    client_id_from_mac, AgentConfig, Datatype, DeviceIdentity, Node, NodeRegistry, Property,
    TopicNamespace,
};

use crate::announce::{device_node, Announcer};
use crate::dispatch::Dispatcher;
use crate::handler::{AgentHandler, NullHandler};
use crate::lifecycle::ConnectionFlags;
use crate::logging::{mqtt_log_layer, spawn_log_publisher};
use crate::mqtt::RumqttcPublisher;
use crate::ota::{OtaManager, OtaSettings};
use crate::platform::{DirFlash, FileFirmwareSource, HostSystem, SystemInfo};
use crate::telemetry;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const OTA_REBOOT_GRACE: Duration = Duration::from_secs(2);
const LOG_CHANNEL_CAPACITY: usize = 64;

pub async fn run() -> anyhow::Result<()> {
    let (log_layer, remote_log, log_rx) = mqtt_log_layer(LOG_CHANNEL_CAPACITY);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .init();

    let config = load_config().await?;
    config.validate().context("invalid configuration")?;

    let system = Arc::new(HostSystem);
    let client_id = if config.mqtt.client_id.is_empty() {
        client_id_from_mac(system.mac())
    } else {
        config.mqtt.client_id.clone()
    };
    info!("starting agent as {client_id}");

    let ns = TopicNamespace::new(&config.device.base_topic, &client_id)?;

    let mut mqtt_options = MqttOptions::new(
        client_id.clone(),
        config.mqtt.host.clone(),
        config.mqtt.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs.into()));
    if !config.mqtt.username.is_empty() {
        mqtt_options.set_credentials(config.mqtt.username.clone(), config.mqtt.password.clone());
    }
    // The broker flips $state to "lost" for us if the agent dies without
    // a clean disconnect.
    mqtt_options.set_last_will(LastWill::new(
        ns.topic(SUBTOPIC_STATE)?,
        DeviceState::Lost.as_str(),
        QoS::AtLeastOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(mqtt_options, EVENT_CHANNEL_CAPACITY);
    let mqtt = RumqttcPublisher::new(client);

    let identity = DeviceIdentity {
        client_id,
        device_name: config.device.device_name.clone(),
        firmware_name: config.device.firmware_name.clone(),
        firmware_version: config.device.firmware_version.clone(),
    };

    let handler = Arc::new(NullHandler);
    let mut registry = NodeRegistry::new();
    registry.add(device_node(
        system.as_ref(),
        config.ota.enabled,
        config.reboot_enabled,
    ));
    for name in &config.device.extra_nodes {
        registry.add(
            Node::new(name, name, "generic")
                .property(Property::new("value", "Value", Datatype::String)),
        );
    }
    handler.register_nodes(&mut registry);

    let announcer = Announcer::new(
        ns.clone(),
        identity,
        registry,
        config.ota.enabled,
        config.reboot_enabled,
        mqtt.clone(),
        system.clone(),
    );

    let flash_dir = std::env::var("HOMIE_AGENT_FLASH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.homie-agent/flash"));
    let ota = OtaManager::new(
        mqtt.clone(),
        FileFirmwareSource,
        DirFlash::new(flash_dir),
        system.clone(),
        handler.clone(),
        OtaSettings {
            url: config.ota.url.clone(),
            cert_pem: config.ota.cert_pem.clone(),
            status_topic: ns.topic(SUBTOPIC_OTA)?,
            reboot_grace: OTA_REBOOT_GRACE,
        },
    );

    let dispatcher = Arc::new(Dispatcher::new(
        ns.clone(),
        mqtt.clone(),
        handler.clone(),
        ota,
        remote_log,
        system.clone(),
        config.reboot_enabled,
        config.ota.enabled,
    )?);

    let _ = spawn_log_publisher(mqtt.clone(), ns.topic(SUBTOPIC_LOG)?, log_rx);

    let flags = Arc::new(ConnectionFlags::new());
    spawn_mqtt_loop(eventloop, dispatcher, flags.clone(), handler);

    telemetry::run(
        Duration::from_secs(config.stats_interval_secs),
        flags,
        announcer,
        ns,
        mqtt,
        system,
    )
    .await;
    Ok(())
}

/// Reads the JSON config file, falling back to defaults when it does not
/// exist. Broker coordinates can still be overridden from the
/// environment afterwards.
async fn load_config() -> anyhow::Result<AgentConfig> {
    let path = std::env::var("HOMIE_AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./homie-agent.json"));

    let mut config = match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<AgentConfig>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("config file {} not found, using defaults", path.display());
            AgentConfig::default()
        }
        Err(err) => return Err(err).context(format!("failed to read {}", path.display())),
    };

    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.mqtt.username = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        config.mqtt.password = pass;
    }
    Ok(config)
}

fn spawn_mqtt_loop<H>(
    mut eventloop: rumqttc::EventLoop,
    dispatcher: Arc<
        Dispatcher<RumqttcPublisher, FileFirmwareSource, DirFlash, HostSystem, H>,
    >,
    flags: Arc<ConnectionFlags>,
    handler: Arc<H>,
) where
    H: AgentHandler + 'static,
{
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    flags.on_connected();
                    handler.connection_changed(true);
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    // Handled off the poll loop: queued publishes only go
                    // out while poll() runs, so command handling must not
                    // block it.
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(&message.topic, &message.payload).await;
                    });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    if flags.is_connected() {
                        warn!("mqtt disconnected by broker");
                        flags.on_disconnected();
                        handler.connection_changed(false);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if flags.is_connected() {
                        flags.on_disconnected();
                        handler.connection_changed(false);
                    }
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    });
}
