// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv5::disconnect::MqttDisconnect;

use super::error::MqttClientError;

/// The connection the outgoing QoS handler writes to.
///
/// Writes never block. A failed write is classified by
/// [`MqttClientError::is_network_error`]: network errors mean the connection
/// itself is broken, any other error only concerns the packet written.
pub trait Channel {
    fn write(&mut self, packet: MqttPacket) -> Result<(), MqttClientError>;

    /// Flushes writes buffered since the last flush.
    fn flush(&mut self) {}

    /// Closes the connection with `disconnect`.
    fn disconnect(&mut self, disconnect: MqttDisconnect);

    /// Escalates a network error to connection-level error handling.
    fn fire_exception(&mut self, error: MqttClientError);
}
