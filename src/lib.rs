// SPDX-License-Identifier: MPL-2.0

//! Outgoing QoS delivery for MQTT clients.
//!
//! The protocol core ([`mqtt_client::qos_handler`]) is sans-I/O and driven by a
//! single execution context; [`mqtt_client::TokioQosClient`] runs it on a
//! tokio task.

pub mod mqtt_client;
pub mod mqtt_serde;
