// SPDX-License-Identifier: MPL-2.0

//! In-memory model of the MQTT packets the outgoing QoS path reads and writes.
//!
//! Byte-level encoding is owned by the transport; this module only carries the
//! decoded values. MQTT 3.1.1 acknowledgments map onto the v5 types with a
//! success reason code and no properties.

pub mod control_packet;
pub mod mqttv5;
pub mod reason_code;

pub use control_packet::{ControlPacketType, MqttPacket};
