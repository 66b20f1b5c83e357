use std::future::Future;

use rumqttc::AsyncClient;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("publish to {topic} rejected: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} rejected: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Publish capability handed to each component, decoupling them from the
/// concrete transport client.
pub trait MqttPublisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), MqttError>> + Send;

    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), MqttError>> + Send;
}

#[derive(Clone)]
pub struct RumqttcPublisher {
    client: AsyncClient,
}

impl RumqttcPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl MqttPublisher for RumqttcPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|err| MqttError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, rumqttc::QoS::AtMostOnce)
            .await
            .map_err(|err| MqttError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}
