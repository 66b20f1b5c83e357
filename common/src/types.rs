use serde::{Deserialize, Serialize};

/// Overall device lifecycle state, published retained on `$state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Ready,
    Lost,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    String,
    Integer,
    Float,
    Boolean,
    Enum,
}

impl Datatype {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
        }
    }
}

/// One publishable attribute of a node. `format` is only meaningful for
/// enum properties, where it lists the accepted command tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub label: String,
    pub datatype: Datatype,
    pub settable: bool,
    pub format: Option<String>,
}

impl Property {
    pub fn new(name: &str, label: &str, datatype: Datatype) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            datatype,
            settable: false,
            format: None,
        }
    }

    pub fn settable(mut self, format: &str) -> Self {
        self.settable = true;
        self.format = Some(format.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub label: String,
    pub node_type: String,
    pub properties: Vec<Property>,
}

impl Node {
    pub fn new(name: &str, label: &str, node_type: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            node_type: node_type.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property_names(&self) -> String {
        self.properties
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Ordered set of nodes announced by the device. Populated once during
/// startup and immutable for the lifetime of a connection epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Comma-joined node names in registration order, for `$nodes`.
    pub fn node_names(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Immutable process-level identity, fixed after startup.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub client_id: String,
    pub device_name: String,
    pub firmware_name: String,
    pub firmware_version: String,
}

/// Lowercase hex MAC with no separators, used as the default client id
/// when none is configured.
pub fn client_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect()
}

/// Colon-separated uppercase MAC, the display form published as a
/// device property.
pub fn mac_display(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registry_joins_node_names_in_order() {
        let mut registry = NodeRegistry::new();
        registry.add(Node::new("device", "Device", "esp32"));
        registry.add(Node::new("relay", "Relay", "gpio"));
        registry.add(Node::new("sensor", "Sensor", "dht22"));
        assert_eq!(registry.node_names(), "device,relay,sensor");
    }

    #[test]
    fn property_names_join_in_order() {
        let node = Node::new("device", "Device", "esp32")
            .property(Property::new("uptime", "Uptime", Datatype::Integer))
            .property(Property::new("rssi", "RSSI", Datatype::Integer));
        assert_eq!(node.property_names(), "uptime,rssi");
    }

    #[test]
    fn settable_property_carries_format() {
        let p = Property::new("ota", "OTA trigger", Datatype::Enum).settable("run");
        assert!(p.settable);
        assert_eq!(p.format.as_deref(), Some("run"));
    }

    #[test]
    fn client_id_is_lowercase_hex_without_separators() {
        let mac = [0xA4, 0xCF, 0x12, 0x00, 0x9B, 0x01];
        assert_eq!(client_id_from_mac(mac), "a4cf12009b01");
        assert_eq!(mac_display(mac), "A4:CF:12:00:9B:01");
    }
}
