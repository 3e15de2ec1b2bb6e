//! MQTT collaborator: the publish contract the dispatcher talks to, and
//! its broker-backed implementation.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{Client, Event, Incoming, LastWill, MqttOptions, QoS};

use crate::config::MqttConfig;

/// How long to wait for the initial CONNACK before giving up startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Set of errors that can occur while talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("invalid QoS level: {0}")]
    InvalidQos(u8),

    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("timed out waiting for the broker to acknowledge the connection")]
    ConnectTimeout,
}

/// Publish contract of the dispatcher's message-bus collaborator.
///
/// Publishing is fire-and-forget from the engine's point of view;
/// delivery and backpressure are this side's concern.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> Result<(), MqttError>;
}

fn qos_level(qos: u8) -> Result<QoS, MqttError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Broker-backed [`Publisher`]. The connection is driven by a dedicated
/// thread; publish calls only enqueue.
pub struct MqttPublisher {
    client: Client,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos_level(qos)?, retain, payload.as_bytes())?;
        Ok(())
    }
}

/// Connects to the broker per the configuration: credentials, 60 s
/// keep-alive, and the configured last will (offline payload, retained).
/// Blocks until the broker acknowledges the connection, then hands the
/// event loop to a background thread which also publishes the online
/// birth message on every (re)connect.
pub fn connect(cfg: &MqttConfig) -> Result<MqttPublisher, MqttError> {
    let client_id = format!("vbus2mqtt-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, cfg.host.as_str(), cfg.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_credentials(cfg.user.as_str(), cfg.pass.as_str());

    let birth = cfg.last_will.as_ref().map(|lw| {
        let topic = format!("{}{}", cfg.topic_prefix, lw.topic);
        options.set_last_will(LastWill::new(
            topic.clone(),
            lw.offline.clone().into_bytes(),
            QoS::AtMostOnce,
            true,
        ));
        (topic, lw.online.clone())
    });

    let (client, mut connection) = Client::new(options, 64);

    // Wait for the first CONNACK so that a bad broker address or bad
    // credentials fail startup instead of festering in the background.
    loop {
        match connection.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(Event::Incoming(Incoming::ConnAck(_)))) => break,
            Ok(Ok(event)) => {
                debug!("mqtt event before connack: {:?}", event);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(MqttError::ConnectTimeout),
        }
    }
    info!("mqtt connected to {}:{}", cfg.host, cfg.port);
    publish_birth(&client, &birth);

    let driver = client.clone();
    thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt reconnected");
                    publish_birth(&driver, &birth);
                }
                Ok(event) => debug!("mqtt event: {:?}", event),
                Err(e) => {
                    warn!("mqtt connection error: {}", e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    });

    Ok(MqttPublisher { client })
}

fn publish_birth(client: &Client, birth: &Option<(String, String)>) {
    if let Some((topic, online)) = birth {
        if let Err(e) = client.publish(topic.as_str(), QoS::AtMostOnce, true, online.as_bytes()) {
            warn!("could not publish birth message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_level(3), Err(MqttError::InvalidQos(3))));
    }
}
