use crate::config::MqttConfig;
use crate::gateway::Intent;
use crate::telemetry::{parse_inbound, topics, PublishError, TelemetryTransport};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Receives intents decoded from the `*/set` topics.
pub type MqttInbound = Box<dyn Fn(Intent) + Send>;

/// Broker session driven by its own network thread.
///
/// Publishing only enqueues into the client's request channel, so the control
/// loop is never held up by the broker.
pub struct MqttTransport {
    client: Client,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn connect(config: &MqttConfig, inbound: MqttInbound) -> Self {
        let mut options = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if !config.user.is_empty() {
            options.set_credentials(config.user.as_str(), config.password.as_str());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let session = Session {
            client: client.clone(),
            connected: connected.clone(),
            stop: stop.clone(),
            reconnect: Duration::from_secs(config.reconnect_s.max(1)),
            inbound,
        };
        let worker = thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || session.run(connection))
            .map_err(|e| warn!(error = %e, "cannot start MQTT thread"))
            .ok();

        info!(host = %config.host, port = config.port, "MQTT session started");
        Self {
            client,
            connected,
            stop,
            worker,
        }
    }
}

impl TelemetryTransport for MqttTransport {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.client.try_disconnect();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Session {
    client: Client,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reconnect: Duration,
    inbound: MqttInbound,
}

impl Session {
    fn run(mut self, mut connection: Connection) {
        for event in connection.iter() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    self.connected.store(true, Ordering::Relaxed);
                    for topic in topics::SUBSCRIPTIONS {
                        if let Err(e) = self.client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!(topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                        debug!(topic = %publish.topic, "ignoring non UTF-8 payload");
                        continue;
                    };
                    match parse_inbound(&publish.topic, payload) {
                        Some(intent) => (self.inbound)(intent),
                        None => debug!(topic = %publish.topic, payload, "ignoring inbound message"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::Relaxed) {
                        warn!(error = %e, "MQTT connection lost");
                    } else {
                        debug!(error = %e, "MQTT connect attempt failed");
                    }
                    thread::sleep(self.reconnect);
                }
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        debug!("MQTT thread stopped");
    }
}
