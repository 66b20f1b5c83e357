use thiserror::Error;

/// Upper bound on a fully formatted topic, including the base topic and
/// client id. Matches the fixed buffer budget of the device transport.
pub const MAX_TOPIC_LEN: usize = 128;

pub const SUBTOPIC_STATE: &str = "$state";
pub const SUBTOPIC_HOMIE: &str = "$homie";
pub const SUBTOPIC_NAME: &str = "$name";
pub const SUBTOPIC_NODES: &str = "$nodes";

pub const SUBTOPIC_REBOOT: &str = "device/reboot";
pub const SUBTOPIC_REBOOT_SET: &str = "device/reboot/set";
pub const SUBTOPIC_OTA: &str = "device/ota";
pub const SUBTOPIC_OTA_SET: &str = "device/ota/set";
pub const SUBTOPIC_LOGGING: &str = "$implementation/logging";
pub const SUBTOPIC_LOG: &str = "$implementation/log";

/// Version of the convention the agent speaks.
pub const HOMIE_VERSION: &str = "3.0.1";

pub const REBOOT_TOKEN: &str = "reboot";
pub const OTA_RUN_TOKEN: &str = "run";
pub const LOGGING_ENABLE_TOKEN: &str = "true";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic would be {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("empty {0} component")]
    EmptyComponent(&'static str),
}

/// Builds wire topics of the form `base_topic/client_id/subtopic`.
///
/// Construction never truncates: a formatted topic over [`MAX_TOPIC_LEN`]
/// is an error the caller must propagate instead of publishing.
#[derive(Debug, Clone)]
pub struct TopicNamespace {
    prefix: String,
}

impl TopicNamespace {
    pub fn new(base_topic: &str, client_id: &str) -> Result<Self, TopicError> {
        if base_topic.is_empty() {
            return Err(TopicError::EmptyComponent("base topic"));
        }
        if client_id.is_empty() {
            return Err(TopicError::EmptyComponent("client id"));
        }

        let prefix = format!("{base_topic}/{client_id}");
        // Leave room for at least "/" plus a one-byte subtopic.
        if prefix.len() + 2 > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong {
                len: prefix.len() + 2,
                max: MAX_TOPIC_LEN,
            });
        }
        Ok(Self { prefix })
    }

    /// The `base_topic/client_id` prefix without a trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic(&self, subtopic: &str) -> Result<String, TopicError> {
        let topic = format!("{}/{subtopic}", self.prefix);
        if topic.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong {
                len: topic.len(),
                max: MAX_TOPIC_LEN,
            });
        }
        Ok(topic)
    }

    /// Strips the namespace prefix from a full wire topic, returning the
    /// subtopic. `None` when the topic belongs to another namespace.
    pub fn subtopic<'a>(&self, full_topic: &'a str) -> Option<&'a str> {
        full_topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prefixed_topic() {
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        assert_eq!(ns.topic("$state").unwrap(), "homie/a1b2c3/$state");
        assert_eq!(
            ns.topic("device/uptime").unwrap(),
            "homie/a1b2c3/device/uptime"
        );
    }

    #[test]
    fn rejects_oversized_topic() {
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let long = "x".repeat(MAX_TOPIC_LEN);
        let err = ns.topic(&long).unwrap_err();
        assert!(matches!(err, TopicError::TooLong { .. }));
    }

    #[test]
    fn rejects_oversized_prefix() {
        let base = "b".repeat(MAX_TOPIC_LEN);
        assert!(matches!(
            TopicNamespace::new(&base, "id"),
            Err(TopicError::TooLong { .. })
        ));
    }

    #[test]
    fn rejects_empty_components() {
        assert!(TopicNamespace::new("", "id").is_err());
        assert!(TopicNamespace::new("homie", "").is_err());
    }

    #[test]
    fn splits_subtopic_from_own_namespace_only() {
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        assert_eq!(
            ns.subtopic("homie/a1b2c3/relay/power/set"),
            Some("relay/power/set")
        );
        assert_eq!(ns.subtopic("homie/other/relay/power/set"), None);
        assert_eq!(ns.subtopic("homie/a1b2c3"), None);
    }

    #[test]
    fn boundary_topic_is_accepted() {
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let fill = MAX_TOPIC_LEN - ns.prefix().len() - 1;
        let sub = "s".repeat(fill);
        assert_eq!(ns.topic(&sub).unwrap().len(), MAX_TOPIC_LEN);
        let sub = "s".repeat(fill + 1);
        assert!(ns.topic(&sub).is_err());
    }
}
