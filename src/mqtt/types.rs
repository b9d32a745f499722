//! Value types shared by the service and the client seam.

use serde::{Deserialize, Serialize};
use std::fmt;

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Broker acknowledgement of a subscribe request.
///
/// Produced once per successful subscribe and handed to every consumer of the
/// topic as the first stream item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionGrant {
    pub topic: String,
    pub qos: QoS,
}

impl SubscriptionGrant {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

impl fmt::Display for SubscriptionGrant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (qos {})", self.topic, u8::from(self.qos))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Requested QoS; `None` asks for QoS 0
    pub qos: Option<QoS>,
}

impl SubscribeOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self { qos: Some(qos) }
    }

    pub fn requested_qos(&self) -> QoS {
        self.qos.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self { qos, retain: false }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}
