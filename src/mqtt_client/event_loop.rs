// SPDX-License-Identifier: MPL-2.0

//! The execution context owning one connection's outgoing QoS state.
//!
//! Every mutation of packet identifiers, inflight exchanges and quota happens on
//! the task that drains the [`LoopTask`] queue. Other threads only hand work
//! over through an [`EventLoopHandle`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::mqtt_serde::control_packet::MqttPacket;

use super::error::MqttClientError;
use super::opts::ConnectionConfig;

/// Work executed on the owning execution context.
#[derive(Debug)]
pub enum LoopTask {
    /// Drain a batch of queued outgoing publishes.
    RunOutgoingQos,
    /// A packet read from the transport.
    Inbound(MqttPacket),
    /// A session was established or resumed; packets are written to `egress`.
    SessionStartOrResume {
        config: ConnectionConfig,
        egress: mpsc::Sender<MqttPacket>,
    },
    /// The transport closed but the session stays alive for a later resume.
    ChannelInactive,
    /// The session ended without resumption.
    SessionEnd(MqttClientError),
    Shutdown,
}

/// Cloneable handle used to schedule [`LoopTask`]s and to lease the context.
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    tasks: mpsc::UnboundedSender<LoopTask>,
    leases: Arc<AtomicUsize>,
}

impl EventLoopHandle {
    /// Creates a handle and the receiving end the owning task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopTask>) {
        let (tasks, rx) = mpsc::unbounded_channel();
        (
            Self {
                tasks,
                leases: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Schedules `task`. Returns `false` once the owning task is gone.
    pub fn execute(&self, task: LoopTask) -> bool {
        self.tasks.send(task).is_ok()
    }

    /// Leases the context for one publish flow.
    pub fn acquire(&self) -> EventLoopLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        EventLoopLease {
            leases: Arc::clone(&self.leases),
            released: AtomicBool::new(false),
        }
    }

    /// Number of leases not yet released.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }
}

/// A lease on an [`EventLoopHandle`], released by the flow lifecycle.
///
/// Holds only the lease counter, never the task queue, so an outstanding
/// lease does not keep the context alive.
#[derive(Debug)]
pub struct EventLoopLease {
    leases: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl EventLoopLease {
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.leases.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
