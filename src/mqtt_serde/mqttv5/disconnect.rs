// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv5::common::properties::Property;
use crate::mqtt_serde::reason_code;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttDisconnect {
    pub reason_code: u8,
    pub properties: Vec<Property>,
}

impl MqttDisconnect {
    pub fn new(reason_code: u8, properties: Vec<Property>) -> Self {
        Self {
            reason_code,
            properties,
        }
    }

    /// DISCONNECT with reason code 0x82 carrying `reason` as reason string.
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::new(
            reason_code::PROTOCOL_ERROR,
            vec![Property::ReasonString(reason.into())],
        )
    }
}
