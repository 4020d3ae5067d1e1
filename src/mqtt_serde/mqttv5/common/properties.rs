// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

pub type Properties = Vec<Property>;

/// The property subset carried by PUBLISH and the QoS acknowledgment packets.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Vec<u8>),
    ReasonString(String),
    TopicAlias(u16),
    UserProperty(String, String),
}

/// Returns the first reason string found in `properties`.
pub fn reason_string(properties: &[Property]) -> Option<&str> {
    properties.iter().find_map(|p| match p {
        Property::ReasonString(s) => Some(s.as_str()),
        _ => None,
    })
}

/// Returns the topic alias carried by `properties`, if any.
pub fn topic_alias(properties: &[Property]) -> Option<u16> {
    properties.iter().find_map(|p| match p {
        Property::TopicAlias(alias) => Some(*alias),
        _ => None,
    })
}

/// Iterates over the user properties in `properties` as `(key, value)` pairs.
pub fn user_properties(properties: &[Property]) -> impl Iterator<Item = (&str, &str)> {
    properties.iter().filter_map(|p| match p {
        Property::UserProperty(k, v) => Some((k.as_str(), v.as_str())),
        _ => None,
    })
}
