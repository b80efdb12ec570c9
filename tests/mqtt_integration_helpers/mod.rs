//! MQTT integration test helpers
//!
//! Starts a throwaway Mosquitto broker in a container for each test and
//! hands out bridge configuration and peer clients pointing at it.

use crate::test_helpers::mqtt_section;
use cloudbridge::config::MqttSection;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use std::time::Duration;
use testcontainers::clients::Cli;
use testcontainers::{Container, GenericImage, RunnableImage};
use uuid::Uuid;

const MOSQUITTO_IMAGE: &str = "eclipse-mosquitto";
const MOSQUITTO_TAG: &str = "2.0";
const MQTT_PORT: u16 = 1883;

/// Upper bound on waiting for the broker to accept connections
const BROKER_READY_TIMEOUT: Duration = Duration::from_secs(20);

/// A running broker; the container stops when the harness is dropped
pub struct MqttTestHarness<'d> {
    _container: Container<'d, GenericImage>,
    port: u16,
}

impl<'d> MqttTestHarness<'d> {
    pub async fn new(docker: &'d Cli) -> Self {
        let image = GenericImage::new(MOSQUITTO_IMAGE, MOSQUITTO_TAG).with_exposed_port(MQTT_PORT);
        // Mosquitto 2 only listens on loopback with its default config
        let args = vec![
            "mosquitto".to_string(),
            "-c".to_string(),
            "/mosquitto-no-auth.conf".to_string(),
        ];
        let container = docker.run(RunnableImage::from((image, args)));
        let port = container.get_host_port_ipv4(MQTT_PORT);

        let harness = Self {
            _container: container,
            port,
        };
        harness.wait_until_ready().await;
        harness
    }

    pub fn broker_url(&self) -> String {
        format!("mqtt://127.0.0.1:{}", self.port)
    }

    pub fn mqtt_config(&self) -> MqttSection {
        mqtt_section(&self.broker_url())
    }

    /// Plain client standing in for the control center or another device
    pub fn peer_client(&self, name: &str) -> (AsyncClient, EventLoop) {
        self.client_with_id(&format!("{name}-{}", Uuid::new_v4()))
    }

    pub fn client_with_id(&self, client_id: &str) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(client_id, "127.0.0.1", self.port);
        options.set_keep_alive(Duration::from_secs(5));
        AsyncClient::new(options, 100)
    }

    async fn wait_until_ready(&self) {
        let deadline = tokio::time::Instant::now() + BROKER_READY_TIMEOUT;
        loop {
            let (_client, mut event_loop) = self.peer_client("readiness");
            if connack(&mut event_loop, Duration::from_secs(2)).await {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "broker on port {} never accepted connections",
                self.port
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Poll `event_loop` until the broker acknowledges the connection
pub async fn connack(event_loop: &mut EventLoop, timeout: Duration) -> bool {
    let handshake = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, handshake).await.unwrap_or(false)
}
