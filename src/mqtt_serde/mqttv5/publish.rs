// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv5::common::properties::Property;

/// A PUBLISH packet.
///
/// The caller hands over a publish without packet identifier; the outgoing QoS
/// handler derives the stateful wire form with [`MqttPublish::to_stateful`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPublish {
    pub topic_name: String,
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
    pub properties: Vec<Property>,
}

impl MqttPublish {
    pub fn new(
        qos: u8,
        topic_name: String,
        packet_id: Option<u16>,
        payload: Vec<u8>,
        retain: bool,
        dup: bool,
    ) -> Self {
        Self::new_with_prop(qos, topic_name, packet_id, payload, retain, dup, Vec::new())
    }

    pub fn new_with_prop(
        qos: u8,
        topic_name: String,
        packet_id: Option<u16>,
        payload: Vec<u8>,
        retain: bool,
        dup: bool,
        properties: Vec<Property>,
    ) -> Self {
        MqttPublish {
            topic_name,
            qos,
            dup,
            retain,
            packet_id,
            payload,
            properties,
        }
    }

    /// Shorthand for a publish without identifier, properties or flags.
    pub fn simple(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: u8) -> Self {
        Self::new(qos, topic.into(), None, payload.into(), false, false)
    }

    /// Builds the packet actually written for this publish.
    ///
    /// `packet_id` is `None` for QoS 0. When `topic_alias` is set the topic name
    /// is replaced by the alias: the topic is sent empty and a `TopicAlias`
    /// property is appended.
    pub fn to_stateful(&self, packet_id: Option<u16>, dup: bool, topic_alias: Option<u16>) -> Self {
        let mut stateful = self.clone();
        stateful.packet_id = packet_id;
        stateful.dup = dup;
        if let Some(alias) = topic_alias {
            stateful.topic_name.clear();
            stateful
                .properties
                .retain(|p| !matches!(p, Property::TopicAlias(_)));
            stateful.properties.push(Property::TopicAlias(alias));
        }
        stateful
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateful_without_alias_keeps_topic() {
        let publish = MqttPublish::simple("sensors/temp", b"21".to_vec(), 1);
        let stateful = publish.to_stateful(Some(3), false, None);

        assert_eq!(stateful.packet_id, Some(3));
        assert_eq!(stateful.topic_name, "sensors/temp");
        assert!(stateful.properties.is_empty());
        // the caller's publish is left untouched
        assert_eq!(publish.packet_id, None);
    }

    #[test]
    fn test_stateful_with_alias_replaces_topic() {
        let mut publish = MqttPublish::simple("sensors/temp", b"21".to_vec(), 2);
        publish.properties.push(Property::TopicAlias(1));
        let stateful = publish.to_stateful(Some(9), false, Some(4));

        assert_eq!(stateful.topic_name, "");
        assert_eq!(stateful.properties, vec![Property::TopicAlias(4)]);
    }
}
