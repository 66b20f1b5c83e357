use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::mqtt::{MqttPublisher, Qos};

/// Runtime toggle for mirroring log lines over MQTT. Off by default;
/// the controller flips it through the logging command topic.
#[derive(Clone, Default)]
pub struct RemoteLogSwitch {
    enabled: Arc<AtomicBool>,
}

impl RemoteLogSwitch {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Tracing layer that forwards formatted event messages to a bounded
/// channel when remote logging is on. Lines are dropped when the
/// channel is full rather than blocking the caller.
pub struct MqttLogLayer {
    switch: RemoteLogSwitch,
    tx: mpsc::Sender<String>,
}

pub fn mqtt_log_layer(capacity: usize) -> (MqttLogLayer, RemoteLogSwitch, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity);
    let switch = RemoteLogSwitch::default();
    (
        MqttLogLayer {
            switch: switch.clone(),
            tx,
        },
        switch,
        rx,
    )
}

impl<S: Subscriber> Layer<S> for MqttLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.switch.is_enabled() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(message) = visitor.message {
            let line = format!("{} {}", event.metadata().level(), message);
            let _ = self.tx.try_send(line);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}

/// Drains the log channel to the log topic. Publish failures are
/// swallowed; logging the failure would feed the layer again.
pub fn spawn_log_publisher<M>(
    mqtt: M,
    topic: String,
    mut rx: mpsc::Receiver<String>,
) -> tokio::task::JoinHandle<()>
where
    M: MqttPublisher + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let _ = mqtt
                .publish(&topic, Qos::AtLeastOnce, false, line.as_bytes())
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::RecordingPublisher;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_dropped_while_switch_is_off() {
        let (layer, switch, mut rx) = mqtt_log_layer(8);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before enable");
            switch.enable();
            tracing::info!("after enable");
        });

        let line = rx.try_recv().unwrap();
        assert!(line.contains("after enable"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (layer, switch, mut rx) = mqtt_log_layer(1);
        switch.enable();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("first");
            tracing::info!("second");
        });

        assert!(rx.try_recv().unwrap().contains("first"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publisher_drains_channel_to_log_topic() {
        let mqtt = RecordingPublisher::new();
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_log_publisher(
            mqtt.clone(),
            "homie/a1b2c3/$implementation/log".to_string(),
            rx,
        );

        tx.send("INFO hello".to_string()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            mqtt.payloads_for("$implementation/log"),
            ["INFO hello"]
        );
    }
}
