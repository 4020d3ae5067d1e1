// SPDX-License-Identifier: MPL-2.0

//! Hooks into the acknowledgment of outgoing QoS 1 and QoS 2 publishes.
//!
//! Interceptors run synchronously on the connection's execution context and
//! must not block.

use std::fmt;
use std::sync::Arc;

use crate::mqtt_serde::mqttv5::puback::MqttPubAck;
use crate::mqtt_serde::mqttv5::pubcomp::MqttPubComp;
use crate::mqtt_serde::mqttv5::publish::MqttPublish;
use crate::mqtt_serde::mqttv5::pubrec::MqttPubRec;
use crate::mqtt_serde::mqttv5::pubrel::{MqttPubRel, PubRelBuilder};

pub trait OutgoingQos1Interceptor: Send + Sync {
    /// Called when a PUBACK for `publish` was received, before its result is delivered.
    fn on_pub_ack(&self, publish: &MqttPublish, pub_ack: &MqttPubAck);
}

pub trait OutgoingQos2Interceptor: Send + Sync {
    /// Called when a successful PUBREC was received. `pub_rel` may be customized
    /// before the PUBREL is sent.
    fn on_pub_rec(&self, _publish: &MqttPublish, _pub_rec: &MqttPubRec, _pub_rel: &mut PubRelBuilder) {}

    /// Called when a PUBREC carrying an error code was received.
    fn on_pub_rec_error(&self, _publish: &MqttPublish, _pub_rec: &MqttPubRec) {}

    /// Called when the PUBCOMP finishing the exchange was received.
    fn on_pub_comp(&self, _pub_rel: &MqttPubRel, _pub_comp: &MqttPubComp) {}
}

/// Configured interceptors. Any of them may be absent.
#[derive(Clone, Default)]
pub struct QosInterceptors {
    pub qos1: Option<Arc<dyn OutgoingQos1Interceptor>>,
    pub qos2: Option<Arc<dyn OutgoingQos2Interceptor>>,
}

impl QosInterceptors {
    pub fn with_qos1(mut self, interceptor: Arc<dyn OutgoingQos1Interceptor>) -> Self {
        self.qos1 = Some(interceptor);
        self
    }

    pub fn with_qos2(mut self, interceptor: Arc<dyn OutgoingQos2Interceptor>) -> Self {
        self.qos2 = Some(interceptor);
        self
    }

    pub(crate) fn on_pub_ack(&self, publish: &MqttPublish, pub_ack: &MqttPubAck) {
        if let Some(interceptor) = &self.qos1 {
            interceptor.on_pub_ack(publish, pub_ack);
        }
    }

    pub(crate) fn on_pub_rec_error(&self, publish: &MqttPublish, pub_rec: &MqttPubRec) {
        if let Some(interceptor) = &self.qos2 {
            interceptor.on_pub_rec_error(publish, pub_rec);
        }
    }

    /// Builds the PUBREL answering `pub_rec`, letting the QoS 2 interceptor customize it.
    pub(crate) fn build_pub_rel(&self, publish: &MqttPublish, pub_rec: &MqttPubRec) -> MqttPubRel {
        let mut builder = PubRelBuilder::from_pub_rec(pub_rec);
        if let Some(interceptor) = &self.qos2 {
            interceptor.on_pub_rec(publish, pub_rec, &mut builder);
        }
        builder.build()
    }

    pub(crate) fn on_pub_comp(&self, pub_rel: &MqttPubRel, pub_comp: &MqttPubComp) {
        if let Some(interceptor) = &self.qos2 {
            interceptor.on_pub_comp(pub_rel, pub_comp);
        }
    }
}

impl fmt::Debug for QosInterceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QosInterceptors")
            .field("qos1", &self.qos1.is_some())
            .field("qos2", &self.qos2.is_some())
            .finish()
    }
}
