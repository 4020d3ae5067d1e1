// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv5::common::properties::{self, Property};
use crate::mqtt_serde::reason_code;

/// PUBREC: the first acknowledgment of a QoS 2 PUBLISH flow.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubRec {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Vec<Property>,
}

impl MqttPubRec {
    pub fn new(packet_id: u16, reason_code: u8, properties: Vec<Property>) -> Self {
        Self {
            packet_id,
            reason_code,
            properties,
        }
    }

    /// Creates a successful PUBREC with no properties (minimal packet)
    pub fn new_success(packet_id: u16) -> Self {
        Self::new(packet_id, reason_code::SUCCESS, Vec::new())
    }

    pub fn is_error(&self) -> bool {
        reason_code::is_error(self.reason_code)
    }

    pub fn reason_string(&self) -> Option<&str> {
        properties::reason_string(&self.properties)
    }
}
