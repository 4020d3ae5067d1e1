// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use serde::Deserialize;

use super::interceptor::QosInterceptors;
use super::topic_alias::TopicAliasMapping;

/// Packet identifiers reserved for concurrent SUBSCRIBE/UNSUBSCRIBE exchanges.
pub const MAX_SUB_PENDING: u16 = 10;

/// Highest send quota the outgoing QoS handler uses.
pub const MAX_SEND_MAXIMUM: u16 = u16::MAX - MAX_SUB_PENDING;

/// How QoS 2 results are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos2ResultMode {
    /// An intermediate result once PUBREL was sent, then a terminal result at PUBCOMP.
    #[default]
    Intermediate,
    /// A single result at PUBCOMP carrying PUBLISH, PUBREC, PUBREL and PUBCOMP.
    Complete,
}

/// Options of the outgoing QoS handler
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosHandlerOptions {
    /// Maximum number of queued publishes written per run
    pub max_batch_size: usize,
    pub qos2_result_mode: Qos2ResultMode,
    /// Capacity of the egress queue between the handler and the transport
    pub egress_capacity: usize,
    #[serde(skip)]
    pub interceptors: QosInterceptors,
}

impl Default for QosHandlerOptions {
    fn default() -> Self {
        QosHandlerOptions {
            max_batch_size: 64,
            qos2_result_mode: Qos2ResultMode::Intermediate,
            egress_capacity: 1024,
            interceptors: QosInterceptors::default(),
        }
    }
}

impl QosHandlerOptions {
    pub fn builder() -> QosHandlerOptionsBuilder {
        QosHandlerOptionsBuilder::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QosHandlerOptionsBuilder {
    options: QosHandlerOptions,
}

impl QosHandlerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch size of 0 is raised to 1.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.options.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn qos2_result_mode(mut self, mode: Qos2ResultMode) -> Self {
        self.options.qos2_result_mode = mode;
        self
    }

    pub fn egress_capacity(mut self, capacity: usize) -> Self {
        self.options.egress_capacity = capacity.max(1);
        self
    }

    pub fn interceptors(mut self, interceptors: QosInterceptors) -> Self {
        self.options.interceptors = interceptors;
        self
    }

    pub fn build(self) -> QosHandlerOptions {
        self.options
    }
}

/// Negotiated parameters of an established or resumed session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Receive Maximum advertised by the broker, 0 when absent
    pub send_maximum: u16,
    pub topic_alias_mapping: Option<Arc<TopicAliasMapping>>,
}

impl ConnectionConfig {
    pub fn new(send_maximum: u16) -> Self {
        Self {
            send_maximum,
            topic_alias_mapping: None,
        }
    }

    pub fn with_topic_alias_mapping(mut self, mapping: TopicAliasMapping) -> Self {
        self.topic_alias_mapping = Some(Arc::new(mapping));
        self
    }

    /// The send quota actually used: an absent Receive Maximum means 65535, and
    /// the result is clamped to [`MAX_SEND_MAXIMUM`].
    pub fn effective_send_maximum(&self) -> u16 {
        let advertised = if self.send_maximum == 0 {
            u16::MAX
        } else {
            self.send_maximum
        };
        advertised.min(MAX_SEND_MAXIMUM)
    }
}
