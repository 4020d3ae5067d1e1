// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv5::*;

/// MQTT control packet types (fixed header, bits 7-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlPacketType {
    CONNECT = 1,
    CONNACK = 2,
    PUBLISH = 3,
    PUBACK = 4,
    PUBREC = 5,
    PUBREL = 6,
    PUBCOMP = 7,
    SUBSCRIBE = 8,
    SUBACK = 9,
    UNSUBSCRIBE = 10,
    UNSUBACK = 11,
    PINGREQ = 12,
    PINGRESP = 13,
    DISCONNECT = 14,
    AUTH = 15,
}

/// Packets exchanged between the outgoing QoS handler and the transport.
///
/// Packets this crate does not interpret travel as [`MqttPacket::Other`] and are
/// passed through untouched.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MqttPacket {
    Publish(publishv5::MqttPublish),
    PubAck(pubackv5::MqttPubAck),
    PubRec(pubrecv5::MqttPubRec),
    PubRel(pubrelv5::MqttPubRel),
    PubComp(pubcompv5::MqttPubComp),
    Disconnect(disconnectv5::MqttDisconnect),
    Other {
        packet_type: ControlPacketType,
        body: Vec<u8>,
    },
}

impl MqttPacket {
    pub fn packet_type(&self) -> ControlPacketType {
        match self {
            MqttPacket::Publish(_) => ControlPacketType::PUBLISH,
            MqttPacket::PubAck(_) => ControlPacketType::PUBACK,
            MqttPacket::PubRec(_) => ControlPacketType::PUBREC,
            MqttPacket::PubRel(_) => ControlPacketType::PUBREL,
            MqttPacket::PubComp(_) => ControlPacketType::PUBCOMP,
            MqttPacket::Disconnect(_) => ControlPacketType::DISCONNECT,
            MqttPacket::Other { packet_type, .. } => *packet_type,
        }
    }

    /// Packet identifier of identifier-carrying packets.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            MqttPacket::Publish(p) => p.packet_id,
            MqttPacket::PubAck(p) => Some(p.packet_id),
            MqttPacket::PubRec(p) => Some(p.packet_id),
            MqttPacket::PubRel(p) => Some(p.packet_id),
            MqttPacket::PubComp(p) => Some(p.packet_id),
            MqttPacket::Disconnect(_) | MqttPacket::Other { .. } => None,
        }
    }
}
