// SPDX-License-Identifier: MPL-2.0

//! Outgoing QoS 0, 1 and 2 delivery for one client session.
//!
//! [`OutgoingQosHandler`] pulls publishes from a [`PublishSource`] under
//! demand bounded by the send quota, assigns packet identifiers, writes the
//! packets and matches PUBACK, PUBREC and PUBCOMP back to the pending
//! exchanges.
//!
//! The handler is not synchronized. It must only be driven from the task
//! draining its [`EventLoopHandle`]; publishes handed over by the source from
//! other threads go through a queue and a counter that schedules a single
//! [`LoopTask::RunOutgoingQos`] when the queue becomes non-empty.
//!
//! A publish that finds no free packet identifier, which happens while a
//! lowered quota is still settling, waits in the handler until an exchange
//! completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv5::disconnect::MqttDisconnect;
use crate::mqtt_serde::mqttv5::puback::MqttPubAck;
use crate::mqtt_serde::mqttv5::pubcomp::MqttPubComp;
use crate::mqtt_serde::mqttv5::publish::MqttPublish;
use crate::mqtt_serde::mqttv5::pubrec::MqttPubRec;
use crate::mqtt_serde::mqttv5::pubrel::MqttPubRel;

use super::ack_flow::{
    AckFlow, PublishResult, PublishWithFlow, Qos2Completion, Qos2IntermediateResult,
};
use super::channel::Channel;
use super::error::MqttClientError;
use super::event_loop::{EventLoopHandle, LoopTask};
use super::inflight::InflightRegistry;
use super::opts::{ConnectionConfig, Qos2ResultMode, QosHandlerOptions};
use super::packet_id::{PacketIdPool, Release};
use super::publish_source::{PublishSource, PublishSubscriber, Subscription};
use super::topic_alias::TopicAliasMapping;

/// QoS 2 exchange whose PUBREL was sent, waiting for PUBCOMP.
#[derive(Debug)]
pub struct PubRelWithFlow {
    pub publish: MqttPublish,
    /// Kept for the complete result, `None` when an intermediate result was delivered
    pub pub_rec: Option<MqttPubRec>,
    pub pub_rel: MqttPubRel,
    pub flow: AckFlow,
    completion: Option<Qos2Completion>,
}

/// State of the exchange owning a packet identifier.
#[derive(Debug)]
pub enum Exchange {
    /// PUBLISH written, waiting for PUBACK (QoS 1) or PUBREC (QoS 2).
    PendingPublish(PublishWithFlow),
    /// PUBREL written, waiting for PUBCOMP.
    PendingCompletion(PubRelWithFlow),
}

impl Exchange {
    pub fn flow(&self) -> &AckFlow {
        match self {
            Exchange::PendingPublish(publish) => &publish.flow,
            Exchange::PendingCompletion(pub_rel) => &pub_rel.flow,
        }
    }

    pub fn is_pending_completion(&self) -> bool {
        matches!(self, Exchange::PendingCompletion(_))
    }
}

/// Receiving side of the publish source: enqueues and schedules a run.
struct QosInbox {
    queue: mpsc::UnboundedSender<PublishWithFlow>,
    queued: Arc<AtomicUsize>,
    /// Set while a run is scheduled and has not started yet
    scheduled: AtomicBool,
    event_loop: EventLoopHandle,
}

impl QosInbox {
    /// Schedules a run unless one is already pending.
    fn schedule_run(&self) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.event_loop.execute(LoopTask::RunOutgoingQos);
        }
    }
}

impl PublishSubscriber for QosInbox {
    fn on_next(&self, publish: PublishWithFlow) {
        if let Err(mpsc::error::SendError(publish)) = self.queue.send(publish) {
            publish.flow.on_error(MqttClientError::NotConnected);
            return;
        }
        if self.queued.fetch_add(1, Ordering::AcqRel) == 0 {
            self.schedule_run();
        }
    }

    fn on_complete(&self) {
        error!("publish source is global and must never complete, this is a bug");
    }

    fn on_error(&self, error: MqttClientError) {
        error!(%error, "publish source is global and must never error, this is a bug");
    }
}

/// Identifier pool, registry and demand channel, created at the first session start.
struct InflightState {
    pool: PacketIdPool,
    registry: InflightRegistry<Exchange>,
    subscription: Arc<dyn Subscription>,
}

impl InflightState {
    /// Forgets `packet_id` and returns it to the pool. Its registry entry
    /// must already be removed.
    fn removed(&mut self, packet_id: u16) {
        self.registry.forget(packet_id);
        self.release(packet_id);
    }

    fn release(&mut self, packet_id: u16) {
        if self.pool.release(packet_id) == Release::ShrinkCompleted {
            self.registry.resize(self.pool.capacity());
            debug!(capacity = self.pool.capacity(), "send quota shrink completed");
        }
    }

    fn resize(&mut self, send_maximum: u16) {
        let pending = self.pool.resize(send_maximum);
        // equal to the current capacity while a shrink is pending
        self.registry.resize(self.pool.capacity());
        if pending > 0 {
            debug!(
                send_maximum,
                pending, "send quota shrink deferred until identifiers above it are released"
            );
        }
    }
}

pub struct OutgoingQosHandler<C: Channel> {
    options: QosHandlerOptions,
    source: Arc<dyn PublishSource>,
    inbox: Arc<QosInbox>,
    queue: mpsc::UnboundedReceiver<PublishWithFlow>,
    queued: Arc<AtomicUsize>,
    /// Publishes taken from the queue that found no free packet identifier
    waiting: VecDeque<PublishWithFlow>,

    /// 0 until the first session start
    send_maximum: u16,
    state: Option<InflightState>,
    topic_alias_mapping: Option<Arc<TopicAliasMapping>>,
    /// Demand still to be withheld after the quota was lowered
    shrink_requests: usize,

    has_session: bool,
    channel: Option<C>,
}

impl<C: Channel> OutgoingQosHandler<C> {
    pub fn new(
        options: QosHandlerOptions,
        source: Arc<dyn PublishSource>,
        event_loop: EventLoopHandle,
    ) -> Self {
        let (tx, queue) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let inbox = Arc::new(QosInbox {
            queue: tx,
            queued: Arc::clone(&queued),
            scheduled: AtomicBool::new(false),
            event_loop,
        });
        Self {
            options,
            source,
            inbox,
            queue,
            queued,
            waiting: VecDeque::new(),
            send_maximum: 0,
            state: None,
            topic_alias_mapping: None,
            shrink_requests: 0,
            has_session: false,
            channel: None,
        }
    }

    /// A session was established or resumed on `channel`.
    ///
    /// The first start subscribes to the publish source with demand equal to
    /// the quota. A resume resizes the identifier space and adjusts demand by
    /// the quota delta.
    pub fn on_session_start_or_resume(&mut self, config: &ConnectionConfig, channel: C) {
        let old_send_maximum = self.send_maximum;
        let new_send_maximum = config.effective_send_maximum();
        self.send_maximum = new_send_maximum;
        self.topic_alias_mapping = config.topic_alias_mapping.clone();
        self.has_session = true;
        self.channel = Some(channel);

        match self.state.as_mut() {
            None => {
                let subscriber: Arc<dyn PublishSubscriber> = self.inbox.clone();
                let subscription = self.source.subscribe(subscriber);
                self.state = Some(InflightState {
                    pool: PacketIdPool::new(new_send_maximum),
                    registry: InflightRegistry::new(new_send_maximum),
                    subscription: Arc::clone(&subscription),
                });
                debug!(send_maximum = new_send_maximum, "outgoing qos session started");
                subscription.request(usize::from(new_send_maximum));
            }
            Some(state) => {
                state.resize(new_send_maximum);
                let new_requests = i64::from(new_send_maximum)
                    - i64::from(old_send_maximum)
                    - self.shrink_requests as i64;
                if new_requests > 0 {
                    state.subscription.request(new_requests as usize);
                    self.shrink_requests = 0;
                } else {
                    self.shrink_requests = new_requests.unsigned_abs() as usize;
                }
                debug!(
                    old_send_maximum,
                    new_send_maximum,
                    shrink_requests = self.shrink_requests,
                    in_flight = state.registry.len(),
                    "outgoing qos session resumed"
                );
            }
        }

        // publishes queued while the channel was inactive
        if self.queued.load(Ordering::Acquire) > 0 || !self.waiting.is_empty() {
            self.inbox.schedule_run();
        }
    }

    /// The channel closed; the session stays and may be resumed.
    pub fn on_channel_inactive(&mut self) {
        if self.channel.take().is_some() {
            debug!("outgoing qos channel inactive");
        }
    }

    /// Writes a batch of queued publishes.
    ///
    /// Publishes waiting for a packet identifier go first. The batch stops at
    /// the first publish that still finds none, so submission order is kept.
    pub fn run(&mut self) {
        self.inbox.scheduled.store(false, Ordering::Release);
        if !self.has_session {
            self.clear_waiting(MqttClientError::NotConnected);
            self.clear_queued(MqttClientError::NotConnected);
            return;
        }
        if self.channel.is_none() {
            return;
        }

        let mut budget = self.options.max_batch_size;
        let mut blocked = false;
        while budget > 0 {
            let Some(publish) = self.waiting.pop_front() else {
                break;
            };
            budget -= 1;
            if let Some(publish) = self.write_publish(publish) {
                self.waiting.push_front(publish);
                blocked = true;
                break;
            }
        }

        let working = if blocked {
            0
        } else {
            self.queued.load(Ordering::Acquire).min(budget)
        };
        let mut polled = 0;
        while polled < working {
            match self.queue.try_recv() {
                Ok(publish) => {
                    polled += 1;
                    if let Some(publish) = self.write_publish(publish) {
                        self.waiting.push_back(publish);
                        blocked = true;
                        break;
                    }
                }
                Err(_) => {
                    error!(working, polled, "queued publish counter out of sync, this is a bug");
                    break;
                }
            }
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.flush();
        }
        let remaining = self.queued.fetch_sub(polled, Ordering::AcqRel) - polled;
        // a blocked run is rescheduled by the next released identifier
        if !blocked && (remaining > 0 || !self.waiting.is_empty()) {
            self.inbox.schedule_run();
        }
    }

    /// Handles an inbound packet. Packets other than PUBACK, PUBREC and
    /// PUBCOMP are returned to pass them on.
    pub fn handle_inbound(&mut self, packet: MqttPacket) -> Option<MqttPacket> {
        match packet {
            MqttPacket::PubAck(pub_ack) => {
                self.read_pub_ack(pub_ack);
                None
            }
            MqttPacket::PubRec(pub_rec) => {
                self.read_pub_rec(pub_rec);
                None
            }
            MqttPacket::PubComp(pub_comp) => {
                self.read_pub_comp(pub_comp);
                None
            }
            other => Some(other),
        }
    }

    /// The session ended without resumption: fails every outstanding exchange,
    /// oldest first, then every queued publish.
    pub fn on_session_end(&mut self, cause: MqttClientError) {
        self.has_session = false;
        self.channel = None;

        let mut pending = 0;
        if let Some(state) = self.state.as_mut() {
            while let Some(packet_id) = state.registry.poll_oldest() {
                let exchange = state.registry.remove(packet_id);
                state.release(packet_id);
                match exchange {
                    Some(exchange) => exchange.flow().on_error(cause.clone()),
                    None => error!(packet_id, "allocated packet identifier without exchange, this is a bug"),
                }
                pending += 1;
            }
        }
        debug!(pending, waiting = self.waiting.len(), %cause, "outgoing qos session end");
        if pending > 0 {
            self.request(pending);
        }
        self.clear_waiting(cause.clone());
        self.clear_queued(cause);
    }

    /// Requests `n` more publishes, withholding demand still owed from a quota shrink.
    pub fn request(&mut self, n: usize) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        if self.shrink_requests == 0 {
            state.subscription.request(n);
        } else if n > self.shrink_requests {
            state.subscription.request(n - self.shrink_requests);
            self.shrink_requests = 0;
        } else {
            self.shrink_requests -= n;
        }
    }

    pub fn send_maximum(&self) -> u16 {
        self.send_maximum
    }

    pub fn has_session(&self) -> bool {
        self.has_session
    }

    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut C> {
        self.channel.as_mut()
    }

    /// Publishes handed over by the source but not yet written.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Publishes taken from the queue that wait for a free packet identifier.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn shrink_requests(&self) -> usize {
        self.shrink_requests
    }

    pub fn in_flight(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.registry.len())
    }

    pub fn exchange(&self, packet_id: u16) -> Option<&Exchange> {
        self.state
            .as_ref()
            .and_then(|state| state.registry.get(packet_id))
    }

    /// Owned packet identifiers, oldest first.
    pub fn allocation_order(&self) -> Vec<u16> {
        self.state
            .as_ref()
            .map(|state| state.registry.allocation_order())
            .unwrap_or_default()
    }

    /// Tracked identifier capacity; above the quota while a shrink is pending.
    pub fn id_capacity(&self) -> u16 {
        self.state.as_ref().map_or(0, |state| state.pool.capacity())
    }

    pub fn registry_capacity(&self) -> u16 {
        self.state
            .as_ref()
            .map_or(0, |state| state.registry.capacity())
    }

    /// Returns the publish when no packet identifier is free for it.
    fn write_publish(&mut self, publish: PublishWithFlow) -> Option<PublishWithFlow> {
        match publish.publish.qos {
            0 => self.write_qos0_publish(publish),
            1 | 2 => return self.write_qos1_or_2_publish(publish),
            qos => {
                publish.flow.on_error(MqttClientError::InvalidPublish {
                    reason: format!("invalid QoS {}", qos),
                });
                self.request(1);
            }
        }
        None
    }

    fn topic_alias(&self, topic: &str) -> Option<u16> {
        self.topic_alias_mapping
            .as_ref()
            .and_then(|mapping| mapping.lookup(topic))
    }

    fn write(&mut self, packet: MqttPacket) -> Result<(), MqttClientError> {
        match self.channel.as_mut() {
            Some(channel) => channel.write(packet),
            None => Err(MqttClientError::ConnectionLost {
                reason: "channel inactive".to_string(),
            }),
        }
    }

    fn fire_exception(&mut self, error: MqttClientError) {
        warn!(%error, "outgoing qos write failed on the connection");
        if let Some(channel) = self.channel.as_mut() {
            channel.fire_exception(error);
        }
    }

    fn write_qos0_publish(&mut self, publish: PublishWithFlow) {
        let alias = self.topic_alias(&publish.publish.topic_name);
        let packet = MqttPacket::Publish(publish.publish.to_stateful(None, false, alias));
        let error = match self.write(packet) {
            Ok(()) => {
                trace!(topic = %publish.publish.topic_name, "qos 0 publish written");
                None
            }
            Err(error) => {
                if error.is_network_error() {
                    self.fire_exception(error.clone());
                }
                Some(error)
            }
        };
        publish.flow.on_next(PublishResult::Qos0 {
            publish: publish.publish,
            error,
        });
        self.request(1);
    }

    fn write_qos1_or_2_publish(&mut self, publish: PublishWithFlow) -> Option<PublishWithFlow> {
        let alias = self.topic_alias(&publish.publish.topic_name);
        let Some(state) = self.state.as_mut() else {
            error!("qos 1 or 2 publish written before the session started, this is a bug");
            publish.flow.on_error(MqttClientError::NotConnected);
            return None;
        };
        let Some(packet_id) = state.pool.acquire() else {
            trace!(
                capacity = state.pool.capacity(),
                in_flight = state.registry.len(),
                "no free packet identifier, publish waits"
            );
            return Some(publish);
        };

        let qos = publish.publish.qos;
        let packet = MqttPacket::Publish(publish.publish.to_stateful(Some(packet_id), false, alias));
        match state.registry.put(packet_id, Exchange::PendingPublish(publish)) {
            Ok(None) => {}
            Ok(Some(_)) => {
                error!(packet_id, "free packet identifier still owned an exchange, this is a bug");
                debug_assert!(false, "packet identifier {} owned twice", packet_id);
            }
            Err(exchange) => {
                error!(packet_id, "packet identifier outside the inflight registry, this is a bug");
                state.release(packet_id);
                exchange.flow().on_error(MqttClientError::InternalError {
                    message: format!("packet identifier {} outside the inflight registry", packet_id),
                });
                self.request(1);
                return None;
            }
        }
        state.registry.record_allocated(packet_id);

        match self.write(packet) {
            Ok(()) => trace!(packet_id, qos, "publish written"),
            Err(error) if error.is_network_error() => self.fire_exception(error),
            Err(error) => self.rollback(packet_id, error),
        }
        None
    }

    /// Undoes a QoS 1 or 2 publish whose write failed locally.
    fn rollback(&mut self, packet_id: u16, error: MqttClientError) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let exchange = state.registry.remove(packet_id);
        state.removed(packet_id);
        debug!(packet_id, %error, "publish write failed, packet identifier rolled back");
        if let Some(exchange) = exchange {
            exchange.flow().on_error(error);
        }
        self.request(1);
        self.wake_waiting();
    }

    fn read_pub_ack(&mut self, pub_ack: MqttPubAck) {
        let packet_id = pub_ack.packet_id;
        let violation = match self.exchange(packet_id) {
            None => Some("PUBACK contained unknown packet identifier"),
            Some(Exchange::PendingCompletion(_)) => Some("PUBACK must not be received for a PUBREL"),
            Some(Exchange::PendingPublish(publish)) if publish.publish.qos != 1 => {
                Some("PUBACK must not be received for a QoS 2 PUBLISH")
            }
            Some(Exchange::PendingPublish(_)) => None,
        };
        if let Some(reason) = violation {
            self.protocol_error(packet_id, reason);
            return;
        }
        let Some(Exchange::PendingPublish(publish)) = self.take_exchange(packet_id) else {
            return;
        };

        self.options.interceptors.on_pub_ack(&publish.publish, &pub_ack);
        let error = pub_ack.is_error().then(|| {
            MqttClientError::publish_failed(packet_id, pub_ack.reason_code, pub_ack.reason_string())
        });
        trace!(packet_id, reason_code = pub_ack.reason_code, "puback received");
        publish.flow.on_next(PublishResult::Qos1 {
            publish: publish.publish,
            pub_ack,
            error,
        });
        self.request(1);
    }

    fn read_pub_rec(&mut self, pub_rec: MqttPubRec) {
        let packet_id = pub_rec.packet_id;
        let violation = match self.exchange(packet_id) {
            None => Some("PUBREC contained unknown packet identifier"),
            Some(Exchange::PendingCompletion(_)) => {
                Some("PUBREC must not be received when the PUBREL has already been sent")
            }
            Some(Exchange::PendingPublish(publish)) if publish.publish.qos != 2 => {
                Some("PUBREC must not be received for a QoS 1 PUBLISH")
            }
            Some(Exchange::PendingPublish(_)) => None,
        };
        if let Some(reason) = violation {
            self.protocol_error(packet_id, reason);
            return;
        }

        if pub_rec.is_error() {
            let Some(Exchange::PendingPublish(publish)) = self.take_exchange(packet_id) else {
                return;
            };
            self.options
                .interceptors
                .on_pub_rec_error(&publish.publish, &pub_rec);
            let error = MqttClientError::publish_failed(
                packet_id,
                pub_rec.reason_code,
                pub_rec.reason_string(),
            );
            trace!(packet_id, reason_code = pub_rec.reason_code, "pubrec with error code received");
            publish.flow.on_next(PublishResult::Qos2Rejected {
                publish: publish.publish,
                pub_rec,
                error,
            });
            self.request(1);
            return;
        }

        let Some(state) = self.state.as_mut() else {
            return;
        };
        let Some(Exchange::PendingPublish(publish)) = state.registry.remove(packet_id) else {
            return;
        };
        let pub_rel = self
            .options
            .interceptors
            .build_pub_rel(&publish.publish, &pub_rec);
        let PublishWithFlow { publish, flow } = publish;

        let (pending, intermediate) = match self.options.qos2_result_mode {
            Qos2ResultMode::Intermediate => {
                let (intermediate, completion) =
                    Qos2IntermediateResult::new(publish.clone(), pub_rec);
                let pending = PubRelWithFlow {
                    publish,
                    pub_rec: None,
                    pub_rel: pub_rel.clone(),
                    flow: flow.clone(),
                    completion: Some(completion),
                };
                (pending, Some(intermediate))
            }
            Qos2ResultMode::Complete => {
                let pending = PubRelWithFlow {
                    publish,
                    pub_rec: Some(pub_rec),
                    pub_rel: pub_rel.clone(),
                    flow: flow.clone(),
                    completion: None,
                };
                (pending, None)
            }
        };
        match state
            .registry
            .put(packet_id, Exchange::PendingCompletion(pending))
        {
            Ok(None) => {}
            Ok(Some(_)) => {
                error!(packet_id, "vacated packet identifier still owned an exchange, this is a bug");
                debug_assert!(false, "packet identifier {} owned twice", packet_id);
            }
            Err(_) => {
                error!(packet_id, "packet identifier left the inflight registry, this is a bug");
                debug_assert!(false, "packet identifier {} outside the registry", packet_id);
            }
        }
        if let Some(intermediate) = intermediate {
            flow.on_next(PublishResult::Qos2Intermediate(intermediate));
        }

        trace!(packet_id, "pubrec received, writing pubrel");
        if let Err(error) = self.write(MqttPacket::PubRel(pub_rel)) {
            self.fire_exception(error);
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.flush();
        }
    }

    fn read_pub_comp(&mut self, pub_comp: MqttPubComp) {
        let packet_id = pub_comp.packet_id;
        let violation = match self.exchange(packet_id) {
            None => Some("PUBCOMP contained unknown packet identifier"),
            Some(Exchange::PendingPublish(publish)) if publish.publish.qos == 1 => {
                Some("PUBCOMP must not be received for a QoS 1 PUBLISH")
            }
            Some(Exchange::PendingPublish(_)) => {
                Some("PUBCOMP must not be received when the PUBREL has not been sent yet")
            }
            Some(Exchange::PendingCompletion(_)) => None,
        };
        if let Some(reason) = violation {
            self.protocol_error(packet_id, reason);
            return;
        }
        let Some(Exchange::PendingCompletion(pending)) = self.take_exchange(packet_id) else {
            return;
        };

        self.options
            .interceptors
            .on_pub_comp(&pending.pub_rel, &pub_comp);
        if let Some(completion) = &pending.completion {
            completion.complete();
        }
        trace!(packet_id, "pubcomp received");
        pending.flow.on_next(PublishResult::Qos2Complete {
            publish: pending.publish,
            pub_rec: pending.pub_rec,
            pub_rel: pending.pub_rel,
            pub_comp,
        });
        self.request(1);
    }

    /// Removes the exchange of `packet_id` and releases the identifier.
    fn take_exchange(&mut self, packet_id: u16) -> Option<Exchange> {
        let state = self.state.as_mut()?;
        let exchange = state.registry.remove(packet_id)?;
        state.removed(packet_id);
        self.wake_waiting();
        Some(exchange)
    }

    fn wake_waiting(&self) {
        if !self.waiting.is_empty() {
            self.inbox.schedule_run();
        }
    }

    /// Fails every publish waiting for a packet identifier and returns its demand.
    fn clear_waiting(&mut self, cause: MqttClientError) {
        let waiting = self.waiting.len();
        for publish in self.waiting.drain(..) {
            publish.flow.on_error(cause.clone());
        }
        if waiting > 0 {
            self.request(waiting);
        }
    }

    /// The registration of `packet_id` is left untouched.
    fn protocol_error(&mut self, packet_id: u16, reason: &str) {
        warn!(packet_id, reason, "protocol violation, disconnecting");
        if let Some(channel) = self.channel.as_mut() {
            channel.disconnect(MqttDisconnect::protocol_error(reason));
        }
    }

    fn clear_queued(&mut self, cause: MqttClientError) {
        loop {
            let queued = self.queued.load(Ordering::Acquire);
            if queued == 0 {
                return;
            }
            let mut polled = 0;
            while polled < queued {
                match self.queue.try_recv() {
                    Ok(publish) => publish.flow.on_error(cause.clone()),
                    Err(_) => break,
                }
                polled += 1;
            }
            if polled > 0 {
                self.request(polled);
            }
            if self.queued.fetch_sub(polled, Ordering::AcqRel) == polled {
                return;
            }
            if polled < queued {
                error!(queued, polled, "queued publish counter out of sync, this is a bug");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_client::ack_flow;
    use crate::mqtt_client::publish_source::PublishFlowables;
    use crate::mqtt_serde::reason_code;

    #[derive(Default)]
    struct NullChannel {
        written: Vec<MqttPacket>,
        disconnects: Vec<MqttDisconnect>,
    }

    impl Channel for NullChannel {
        fn write(&mut self, packet: MqttPacket) -> Result<(), MqttClientError> {
            self.written.push(packet);
            Ok(())
        }
        fn disconnect(&mut self, disconnect: MqttDisconnect) {
            self.disconnects.push(disconnect);
        }
        fn fire_exception(&mut self, _error: MqttClientError) {}
    }

    fn handler() -> (OutgoingQosHandler<NullChannel>, PublishFlowables, EventLoopHandle) {
        let (event_loop, _rx) = EventLoopHandle::new();
        let source = PublishFlowables::new();
        let handler = OutgoingQosHandler::new(
            QosHandlerOptions::default(),
            Arc::new(source.clone()),
            event_loop.clone(),
        );
        (handler, source, event_loop)
    }

    #[test]
    fn test_first_start_requests_quota() {
        let (mut handler, source, _loop) = handler();
        handler.on_session_start_or_resume(&ConnectionConfig::new(5), NullChannel::default());
        assert_eq!(handler.send_maximum(), 5);
        assert_eq!(source.demand(), 5);
        assert_eq!(handler.id_capacity(), 5);
        assert_eq!(handler.registry_capacity(), 5);
    }

    #[test]
    fn test_resume_with_lower_quota_withholds_demand() {
        let (mut handler, source, _loop) = handler();
        handler.on_session_start_or_resume(&ConnectionConfig::new(10), NullChannel::default());
        handler.on_channel_inactive();
        handler.on_session_start_or_resume(&ConnectionConfig::new(4), NullChannel::default());
        assert_eq!(handler.shrink_requests(), 6);

        // replenished demand is absorbed until the shrink is paid off
        handler.request(4);
        assert_eq!(handler.shrink_requests(), 2);
        assert_eq!(source.demand(), 10);
        handler.request(3);
        assert_eq!(handler.shrink_requests(), 0);
        assert_eq!(source.demand(), 11);

        // growing again passes the full delta
        handler.on_session_start_or_resume(&ConnectionConfig::new(7), NullChannel::default());
        assert_eq!(source.demand(), 14);
    }

    #[test]
    fn test_resume_grow_offsets_pending_shrink_requests() {
        let (mut handler, source, _loop) = handler();
        handler.on_session_start_or_resume(&ConnectionConfig::new(10), NullChannel::default());
        handler.on_session_start_or_resume(&ConnectionConfig::new(4), NullChannel::default());
        assert_eq!(handler.shrink_requests(), 6);

        handler.on_session_start_or_resume(&ConnectionConfig::new(8), NullChannel::default());
        assert_eq!(handler.shrink_requests(), 2);
        assert_eq!(source.demand(), 10);

        handler.on_session_start_or_resume(&ConnectionConfig::new(12), NullChannel::default());
        assert_eq!(handler.shrink_requests(), 0);
        assert_eq!(source.demand(), 12);
    }

    #[test]
    fn test_invalid_qos_fails_flow() {
        let (mut handler, source, event_loop) = handler();
        handler.on_session_start_or_resume(&ConnectionConfig::new(2), NullChannel::default());

        let (flow, mut results) = ack_flow::channel(&event_loop, 1);
        source.add(vec![MqttPublish::simple("t", b"x".to_vec(), 3)], flow);
        handler.run();

        assert!(matches!(
            results.try_recv(),
            Some(Err(MqttClientError::InvalidPublish { .. }))
        ));
        assert!(handler.channel().unwrap().written.is_empty());
        assert_eq!(source.demand(), 2);
    }

    #[test]
    fn test_ack_before_session_start_is_protocol_error_without_channel() {
        let (mut handler, _source, _loop) = handler();
        let passthrough = handler.handle_inbound(MqttPacket::PubAck(MqttPubAck::new(
            1,
            reason_code::SUCCESS,
            Vec::new(),
        )));
        assert!(passthrough.is_none());
        assert_eq!(handler.in_flight(), 0);
    }

    #[test]
    fn test_source_completion_is_logged_only() {
        let (handler, _source, _loop) = handler();
        handler.inbox.on_complete();
        handler.inbox.on_error(MqttClientError::InternalError {
            message: "boom".to_string(),
        });
        assert_eq!(handler.queued(), 0);
    }
}
