// SPDX-License-Identifier: MPL-2.0

//! Tokio driver of the outgoing QoS handler.
//!
//! A worker task owns the [`OutgoingQosHandler`] and is its single execution
//! context: it drains the [`LoopTask`] queue and hands connection events to a
//! [`QosEventHandler`]. [`TokioQosClient`] is the caller facade submitting
//! publishes and relaying transport notifications to the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv5::disconnect::MqttDisconnect;
use crate::mqtt_serde::mqttv5::publish::MqttPublish;

use super::ack_flow::{self, PublishResults};
use super::channel::Channel;
use super::error::{MqttClientError, MqttClientResult};
use super::event_loop::{EventLoopHandle, LoopTask};
use super::opts::{ConnectionConfig, QosHandlerOptions};
use super::publish_source::PublishFlowables;
use super::qos_handler::OutgoingQosHandler;

/// Events the handler raises on the connection.
#[derive(Debug, Clone)]
pub enum QosConnectionEvent {
    /// The connection was closed with a protocol error DISCONNECT.
    ProtocolError(MqttDisconnect),
    /// A network error occurred while writing.
    Exception(MqttClientError),
    /// An inbound packet not handled by the outgoing QoS flow.
    Passthrough(MqttPacket),
}

/// Event handler trait for connection events raised by the worker
#[async_trait]
pub trait QosEventHandler: Send + Sync {
    /// The handler closed the connection because of a protocol violation
    async fn on_protocol_error(&mut self, disconnect: &MqttDisconnect) {
        let _ = disconnect;
    }

    /// A write failed on the connection; the connection should be torn down
    async fn on_exception(&mut self, error: &MqttClientError) {
        let _ = error;
    }

    /// An inbound packet for other handlers
    async fn on_passthrough(&mut self, packet: &MqttPacket) {
        let _ = packet;
    }
}

/// [`QosEventHandler`] that forwards every event into a channel.
pub struct ChannelEventHandler {
    events: mpsc::UnboundedSender<QosConnectionEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QosConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

#[async_trait]
impl QosEventHandler for ChannelEventHandler {
    async fn on_protocol_error(&mut self, disconnect: &MqttDisconnect) {
        let _ = self
            .events
            .send(QosConnectionEvent::ProtocolError(disconnect.clone()));
    }

    async fn on_exception(&mut self, error: &MqttClientError) {
        let _ = self.events.send(QosConnectionEvent::Exception(error.clone()));
    }

    async fn on_passthrough(&mut self, packet: &MqttPacket) {
        let _ = self
            .events
            .send(QosConnectionEvent::Passthrough(packet.clone()));
    }
}

/// [`Channel`] writing into the bounded egress queue read by the transport.
pub struct EgressChannel {
    egress: mpsc::Sender<MqttPacket>,
    events: mpsc::UnboundedSender<QosConnectionEvent>,
}

impl EgressChannel {
    pub fn new(
        egress: mpsc::Sender<MqttPacket>,
        events: mpsc::UnboundedSender<QosConnectionEvent>,
    ) -> Self {
        Self { egress, events }
    }
}

impl Channel for EgressChannel {
    fn write(&mut self, packet: MqttPacket) -> Result<(), MqttClientError> {
        self.egress.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => MqttClientError::BufferFull {
                buffer_type: "egress".to_string(),
                capacity: self.egress.max_capacity(),
            },
            TrySendError::Closed(_) => MqttClientError::ChannelClosed {
                channel: "egress".to_string(),
            },
        })
    }

    fn disconnect(&mut self, disconnect: MqttDisconnect) {
        if let Err(e) = self
            .egress
            .try_send(MqttPacket::Disconnect(disconnect.clone()))
        {
            warn!(error = %e, reason_code = disconnect.reason_code, "protocol error DISCONNECT not queued");
        }
        let _ = self
            .events
            .send(QosConnectionEvent::ProtocolError(disconnect));
    }

    fn fire_exception(&mut self, error: MqttClientError) {
        let _ = self.events.send(QosConnectionEvent::Exception(error));
    }
}

/// Tokio-based outgoing QoS client
pub struct TokioQosClient {
    event_loop: EventLoopHandle,
    source: PublishFlowables,
    session_active: Arc<AtomicBool>,
    egress_capacity: usize,
}

impl TokioQosClient {
    /// Spawns the worker task. Must be called within a tokio runtime.
    pub fn new(options: QosHandlerOptions, event_handler: Box<dyn QosEventHandler>) -> Self {
        let (event_loop, tasks) = EventLoopHandle::new();
        let source = PublishFlowables::new();
        let egress_capacity = options.egress_capacity.max(1);

        let handler = OutgoingQosHandler::new(options, Arc::new(source.clone()), event_loop.clone());
        let worker = QosWorker::new(handler, tasks, event_handler);
        tokio::spawn(async move {
            worker.run().await;
        });

        TokioQosClient {
            event_loop,
            source,
            session_active: Arc::new(AtomicBool::new(false)),
            egress_capacity,
        }
    }

    pub fn publish(&self, publish: MqttPublish) -> PublishResults {
        self.publish_all(vec![publish])
    }

    /// Publishes several messages through one result receiver.
    pub fn publish_all(&self, publishes: Vec<MqttPublish>) -> PublishResults {
        let (flow, results) = ack_flow::channel(&self.event_loop, publishes.len());
        if !self.session_active.load(Ordering::Acquire) {
            if flow.init() {
                flow.on_error(MqttClientError::NotConnected);
            }
            return results;
        }
        self.source.add(publishes, flow);
        results
    }

    /// Starts or resumes the session. Returns the egress queue the transport
    /// must write to the broker.
    pub fn start_session(
        &self,
        config: ConnectionConfig,
    ) -> MqttClientResult<mpsc::Receiver<MqttPacket>> {
        let (egress, egress_rx) = mpsc::channel(self.egress_capacity);
        self.send_task(LoopTask::SessionStartOrResume { config, egress })?;
        self.session_active.store(true, Ordering::Release);
        Ok(egress_rx)
    }

    /// The transport closed; the session may be resumed with [`start_session`](Self::start_session).
    pub fn channel_inactive(&self) -> MqttClientResult<()> {
        self.send_task(LoopTask::ChannelInactive)
    }

    /// Ends the session, failing every outstanding publish with `cause`.
    pub fn end_session(&self, cause: MqttClientError) -> MqttClientResult<()> {
        self.session_active.store(false, Ordering::Release);
        self.send_task(LoopTask::SessionEnd(cause))
    }

    /// Hands a packet read from the transport to the worker.
    pub fn handle_inbound(&self, packet: MqttPacket) -> MqttClientResult<()> {
        self.send_task(LoopTask::Inbound(packet))
    }

    /// Number of publish calls whose results are not complete yet.
    pub fn active_flows(&self) -> usize {
        self.event_loop.active_leases()
    }

    /// Stops the worker. Outstanding publishes fail with `NotConnected`.
    pub fn shutdown(self) {
        drop(self);
    }

    fn send_task(&self, task: LoopTask) -> MqttClientResult<()> {
        if self.event_loop.execute(task) {
            Ok(())
        } else {
            Err(MqttClientError::ChannelClosed {
                channel: "worker".to_string(),
            })
        }
    }
}

impl Drop for TokioQosClient {
    fn drop(&mut self) {
        self.event_loop.execute(LoopTask::Shutdown);
    }
}

/// Worker task owning the handler.
struct QosWorker {
    handler: OutgoingQosHandler<EgressChannel>,
    tasks: mpsc::UnboundedReceiver<LoopTask>,
    events_tx: mpsc::UnboundedSender<QosConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<QosConnectionEvent>,
    event_handler: Box<dyn QosEventHandler>,
}

impl QosWorker {
    fn new(
        handler: OutgoingQosHandler<EgressChannel>,
        tasks: mpsc::UnboundedReceiver<LoopTask>,
        event_handler: Box<dyn QosEventHandler>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        QosWorker {
            handler,
            tasks,
            events_tx,
            events_rx,
            event_handler,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                // events first so they are reported in the order they were raised
                biased;

                Some(event) = self.events_rx.recv() => {
                    self.dispatch(event).await;
                }

                task = self.tasks.recv() => {
                    match task {
                        Some(task) => {
                            if !self.handle_task(task) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event).await;
        }
        debug!("outgoing qos worker stopped");
    }

    fn handle_task(&mut self, task: LoopTask) -> bool {
        match task {
            LoopTask::RunOutgoingQos => self.handler.run(),
            LoopTask::Inbound(packet) => {
                if let Some(packet) = self.handler.handle_inbound(packet) {
                    let _ = self.events_tx.send(QosConnectionEvent::Passthrough(packet));
                }
            }
            LoopTask::SessionStartOrResume { config, egress } => {
                let channel = EgressChannel::new(egress, self.events_tx.clone());
                self.handler.on_session_start_or_resume(&config, channel);
            }
            LoopTask::ChannelInactive => self.handler.on_channel_inactive(),
            LoopTask::SessionEnd(cause) => self.handler.on_session_end(cause),
            LoopTask::Shutdown => {
                self.handler.on_session_end(MqttClientError::NotConnected);
                return false;
            }
        }
        true
    }

    async fn dispatch(&mut self, event: QosConnectionEvent) {
        trace!(?event, "outgoing qos connection event");
        match &event {
            QosConnectionEvent::ProtocolError(disconnect) => {
                self.event_handler.on_protocol_error(disconnect).await
            }
            QosConnectionEvent::Exception(error) => self.event_handler.on_exception(error).await,
            QosConnectionEvent::Passthrough(packet) => {
                self.event_handler.on_passthrough(packet).await
            }
        }
    }
}
