// SPDX-License-Identifier: MPL-2.0

pub mod ack_flow;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod flow;
pub mod inflight;
pub mod interceptor;
pub mod opts;
pub mod packet_id;
pub mod publish_source;
pub mod qos_handler;
pub mod tokio_qos_client;
pub mod topic_alias;

pub use ack_flow::{AckFlow, PublishResult, PublishResults, PublishWithFlow, Qos2IntermediateResult};
pub use channel::Channel;
pub use error::{MqttClientError, MqttClientResult};
pub use event_loop::{EventLoopHandle, LoopTask};
pub use interceptor::{OutgoingQos1Interceptor, OutgoingQos2Interceptor, QosInterceptors};
pub use opts::{ConnectionConfig, Qos2ResultMode, QosHandlerOptions};
pub use publish_source::{PublishFlowables, PublishSource, PublishSubscriber, Subscription};
pub use qos_handler::{Exchange, OutgoingQosHandler};
pub use tokio_qos_client::{
    ChannelEventHandler, EgressChannel, QosConnectionEvent, QosEventHandler, TokioQosClient,
};
pub use topic_alias::TopicAliasMapping;
