// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv5::common::properties::Property;
use crate::mqtt_serde::mqttv5::pubrec::MqttPubRec;
use crate::mqtt_serde::reason_code;

/// Represents the PUBREL packet in MQTT v5.0.
/// PUBREL is the second acknowledgment in a QoS 2 PUBLISH packet flow.
/// It is sent in response to a PUBREC packet.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubRel {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Vec<Property>,
}

impl MqttPubRel {
    pub fn new(packet_id: u16, reason_code: u8, properties: Vec<Property>) -> Self {
        Self {
            packet_id,
            reason_code,
            properties,
        }
    }

    /// Creates a successful PUBREL with no properties (minimal packet)
    pub fn new_success(packet_id: u16) -> Self {
        Self::new(packet_id, reason_code::SUCCESS, Vec::new())
    }
}

/// Mutable PUBREL handed to the QoS 2 interceptor before the PUBREL is sent.
///
/// The packet identifier is fixed by the PUBREC; only the reason code and the
/// v5 properties may be customized.
#[derive(Debug, Clone)]
pub struct PubRelBuilder {
    packet_id: u16,
    reason_code: u8,
    reason_string: Option<String>,
    user_properties: Vec<(String, String)>,
}

impl PubRelBuilder {
    pub fn from_pub_rec(pub_rec: &MqttPubRec) -> Self {
        Self {
            packet_id: pub_rec.packet_id,
            reason_code: reason_code::SUCCESS,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Only `SUCCESS` and `PACKET_IDENTIFIER_NOT_FOUND` are valid for PUBREL.
    pub fn reason_code(&mut self, reason_code: u8) -> &mut Self {
        if reason_code == reason_code::SUCCESS
            || reason_code == reason_code::PACKET_IDENTIFIER_NOT_FOUND
        {
            self.reason_code = reason_code;
        }
        self
    }

    pub fn reason_string(&mut self, reason: impl Into<String>) -> &mut Self {
        self.reason_string = Some(reason.into());
        self
    }

    pub fn user_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> MqttPubRel {
        let mut properties = Vec::with_capacity(self.user_properties.len() + 1);
        if let Some(reason) = self.reason_string {
            properties.push(Property::ReasonString(reason));
        }
        properties.extend(
            self.user_properties
                .into_iter()
                .map(|(k, v)| Property::UserProperty(k, v)),
        );
        MqttPubRel::new(self.packet_id, self.reason_code, properties)
    }
}
