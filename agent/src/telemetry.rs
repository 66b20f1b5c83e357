use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use homie_common::TopicNamespace;

use crate::announce::Announcer;
use crate::lifecycle::ConnectionFlags;
use crate::mqtt::{MqttPublisher, Qos};
use crate::platform::{uptime_secs, SystemInfo};

/// Maps Wi-Fi RSSI in dBm to a 0..=100 quality percentage. -100 dBm and
/// below is 0, -50 dBm and above is 100, linear in between.
pub fn signal_percent(rssi: i32) -> i32 {
    ((rssi + 100) * 2).clamp(0, 100)
}

/// Periodic stats task. Each tick first completes any pending announce,
/// then refreshes the runtime properties of the device node. Never
/// returns; a broken connection only skips ticks until the transport
/// reconnects.
pub async fn run<M, S>(
    interval: Duration,
    flags: Arc<ConnectionFlags>,
    announcer: Announcer<M, S>,
    ns: TopicNamespace,
    mqtt: M,
    system: Arc<S>,
) where
    M: MqttPublisher,
    S: SystemInfo,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        tick(&flags, &announcer, &ns, &mqtt, system.as_ref()).await;
    }
}

/// One telemetry round. A failed announce leaves the pending flag set
/// for the next tick but never blocks the stats refresh.
pub async fn tick<M, S>(
    flags: &ConnectionFlags,
    announcer: &Announcer<M, S>,
    ns: &TopicNamespace,
    mqtt: &M,
    system: &S,
) where
    M: MqttPublisher,
    S: SystemInfo,
{
    if !flags.is_connected() {
        return;
    }

    if flags.announce_required() {
        match announcer.announce().await {
            Ok(()) => flags.announce_done(),
            Err(err) => warn!("announce failed, retrying next tick: {err}"),
        }
    }

    publish_stats(ns, mqtt, system).await;
}

/// One round of runtime stats. Failures are logged and the remaining
/// properties are still attempted; a partial update beats none.
pub async fn publish_stats<M, S>(ns: &TopicNamespace, mqtt: &M, system: &S)
where
    M: MqttPublisher,
    S: SystemInfo,
{
    let rssi = system.rssi().unwrap_or(0);
    let stats = [
        ("device/uptime", uptime_secs().to_string()),
        ("device/rssi", rssi.to_string()),
        ("device/signal", signal_percent(rssi).to_string()),
        ("device/freeheap", system.free_heap().to_string()),
    ];

    for (subtopic, value) in stats {
        let topic = match ns.topic(subtopic) {
            Ok(topic) => topic,
            Err(err) => {
                warn!("stats topic rejected: {err}");
                continue;
            }
        };
        debug!("stats: {topic} = {value}");
        if let Err(err) = mqtt
            .publish(&topic, Qos::AtLeastOnce, true, value.as_bytes())
            .await
        {
            warn!("stats publish failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::device_node;
    use crate::mqtt::testing::RecordingPublisher;
    use homie_common::{DeviceIdentity, NodeRegistry};
    use std::net::IpAddr;

    struct FixedSystem {
        rssi: Option<i32>,
        free_heap: u64,
    }

    impl SystemInfo for FixedSystem {
        fn mac(&self) -> [u8; 6] {
            [0xA4, 0xCF, 0x12, 0x00, 0x9B, 0x01]
        }
        fn ip(&self) -> Option<IpAddr> {
            None
        }
        fn rssi(&self) -> Option<i32> {
            self.rssi
        }
        fn free_heap(&self) -> u64 {
            self.free_heap
        }
        fn sdk_version(&self) -> &str {
            "test"
        }
        fn implementation(&self) -> &str {
            "test"
        }
        fn restart(&self) {}
    }

    #[test]
    fn signal_maps_rssi_to_percentage() {
        assert_eq!(signal_percent(-100), 0);
        assert_eq!(signal_percent(-75), 50);
        assert_eq!(signal_percent(-50), 100);
        assert_eq!(signal_percent(-120), 0);
        assert_eq!(signal_percent(-30), 100);
    }

    #[tokio::test]
    async fn stats_publish_all_runtime_properties_retained() {
        let mqtt = RecordingPublisher::new();
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let system = FixedSystem {
            rssi: Some(-75),
            free_heap: 51200,
        };

        publish_stats(&ns, &mqtt, &system).await;

        assert_eq!(mqtt.payloads_for("device/rssi"), ["-75"]);
        assert_eq!(mqtt.payloads_for("device/signal"), ["50"]);
        assert_eq!(mqtt.payloads_for("device/freeheap"), ["51200"]);
        assert_eq!(mqtt.payloads_for("device/uptime").len(), 1);
        assert!(mqtt.ops().iter().all(|op| matches!(
            op,
            crate::mqtt::testing::Op::Publish { retain: true, .. }
        )));
    }

    #[tokio::test]
    async fn missing_rssi_falls_back_to_zero_dbm() {
        let mqtt = RecordingPublisher::new();
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let system = FixedSystem {
            rssi: None,
            free_heap: 0,
        };

        publish_stats(&ns, &mqtt, &system).await;

        assert_eq!(mqtt.payloads_for("device/rssi"), ["0"]);
        assert_eq!(mqtt.payloads_for("device/signal"), ["100"]);
    }

    fn announcer_for(
        mqtt: RecordingPublisher,
        system: Arc<FixedSystem>,
    ) -> Announcer<RecordingPublisher, FixedSystem> {
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let mut registry = NodeRegistry::new();
        registry.add(device_node(system.as_ref(), false, false));
        let identity = DeviceIdentity {
            client_id: "a1b2c3".to_string(),
            device_name: "Test Device".to_string(),
            firmware_name: "homie-agent".to_string(),
            firmware_version: "0.1.0".to_string(),
        };
        Announcer::new(ns, identity, registry, false, false, mqtt, system)
    }

    #[tokio::test]
    async fn failed_announce_still_refreshes_stats() {
        let mqtt = RecordingPublisher::new();
        mqtt.fail_publishes_containing("$homie");
        let system = Arc::new(FixedSystem {
            rssi: Some(-60),
            free_heap: 2048,
        });
        let flags = ConnectionFlags::new();
        flags.on_connected();
        let announcer = announcer_for(mqtt.clone(), system.clone());
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();

        tick(&flags, &announcer, &ns, &mqtt, system.as_ref()).await;

        // The announce stays pending for the next round, but the stats
        // round still went out.
        assert!(flags.announce_required());
        assert_eq!(mqtt.payloads_for("device/freeheap"), ["2048"]);
        assert_eq!(mqtt.payloads_for("device/signal"), ["80"]);
    }

    #[tokio::test]
    async fn tick_completes_pending_announce_before_stats() {
        let mqtt = RecordingPublisher::new();
        let system = Arc::new(FixedSystem {
            rssi: Some(-60),
            free_heap: 2048,
        });
        let flags = ConnectionFlags::new();
        flags.on_connected();
        let announcer = announcer_for(mqtt.clone(), system.clone());
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();

        tick(&flags, &announcer, &ns, &mqtt, system.as_ref()).await;

        assert!(!flags.announce_required());
        assert_eq!(
            mqtt.payloads_for("$state"),
            vec!["init".to_string(), "ready".to_string()]
        );
        assert_eq!(mqtt.payloads_for("device/freeheap"), ["2048"]);
    }

    #[tokio::test]
    async fn disconnected_tick_publishes_nothing() {
        let mqtt = RecordingPublisher::new();
        let system = Arc::new(FixedSystem {
            rssi: None,
            free_heap: 0,
        });
        let flags = ConnectionFlags::new();
        let announcer = announcer_for(mqtt.clone(), system.clone());
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();

        tick(&flags, &announcer, &ns, &mqtt, system.as_ref()).await;

        assert!(mqtt.ops().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_remaining_stats() {
        let mqtt = RecordingPublisher::new();
        mqtt.fail_publishes_containing("device/rssi");
        let ns = TopicNamespace::new("homie", "a1b2c3").unwrap();
        let system = FixedSystem {
            rssi: Some(-60),
            free_heap: 1024,
        };

        publish_stats(&ns, &mqtt, &system).await;

        assert_eq!(mqtt.payloads_for("device/signal"), ["80"]);
        assert_eq!(mqtt.payloads_for("device/freeheap"), ["1024"]);
    }
}
