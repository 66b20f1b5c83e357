pub mod config;
pub mod topics;
pub mod types;

pub use config::{AgentConfig, ConfigError, DeviceConfig, MqttConfig, OtaConfig};
pub use topics::{TopicError, TopicNamespace, MAX_TOPIC_LEN};
pub use types::{
    client_id_from_mac, mac_display, Datatype, DeviceIdentity, DeviceState, Node, NodeRegistry,
    Property,
};
