//! Session configuration: broker endpoint, connection options and the topics
//! the supervisor keeps subscribed.

use serde::{Deserialize, Serialize};
use tether_mqtt_session::{Endpoint, QoS, SessionOptions};
use validator::{Validate, ValidationError};

fn default_client_id() -> String {
    format!("tether-{}", uuid::Uuid::new_v4().simple())
}

fn validate_client_id(client_id: &str) -> Result<(), ValidationError> {
    if tether_mqtt_session::events::is_valid_client_id(client_id) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_client_id"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionConfig {
    /// Unique per broker. Generated when omitted, so a restart shows up as
    /// a new client.
    #[validate(
        length(min = 1, max = 128),
        custom(function = "validate_client_id", message = "Client id must not contain '#'")
    )]
    pub client_id: String,

    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    pub ssl: bool,

    /// Capacity of the transport's request queue.
    #[validate(range(min = 1, max = 65535))]
    pub request_capacity: usize,

    #[validate(nested)]
    pub options: SessionOptions,

    #[cfg(feature = "tether-mqtt-rumqtt")]
    #[validate(nested)]
    pub tls: tether_mqtt_rumqtt::TlsSettings,

    #[validate(nested)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            host: "localhost".to_string(),
            port: 1883,
            ssl: false,
            request_capacity: 64,
            options: SessionOptions::default(),
            #[cfg(feature = "tether-mqtt-rumqtt")]
            tls: Default::default(),
            subscriptions: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port).with_ssl(self.ssl)
    }
}

/// A topic filter kept subscribed across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SubscriptionConfig {
    #[validate(length(min = 1, max = 65535))]
    pub topic: String,

    /// 0, 1 or 2.
    #[serde(default)]
    pub qos: QoS,
}
