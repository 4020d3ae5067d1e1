// SPDX-License-Identifier: MPL-2.0

//! Result sinks of publish calls.
//!
//! A publish call creates a pair: an [`AckFlow`] travelling with the publishes
//! into the outgoing QoS handler, and a [`PublishResults`] receiver kept by the
//! caller. The handler only ever writes into the flow.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;

use crate::mqtt_serde::mqttv5::puback::MqttPubAck;
use crate::mqtt_serde::mqttv5::pubcomp::MqttPubComp;
use crate::mqtt_serde::mqttv5::publish::MqttPublish;
use crate::mqtt_serde::mqttv5::pubrec::MqttPubRec;
use crate::mqtt_serde::mqttv5::pubrel::MqttPubRel;

use super::error::MqttClientError;
use super::event_loop::EventLoopHandle;
use super::flow::FlowLifecycle;

/// Outcome of one publish.
#[derive(Debug, Clone)]
pub enum PublishResult {
    /// QoS 0 publish written, or failed to be written.
    Qos0 {
        publish: MqttPublish,
        error: Option<MqttClientError>,
    },
    /// QoS 1 publish acknowledged. `error` is set if the PUBACK carried an error code.
    Qos1 {
        publish: MqttPublish,
        pub_ack: MqttPubAck,
        error: Option<MqttClientError>,
    },
    /// QoS 2 publish rejected by a PUBREC error code. No PUBREL is sent.
    Qos2Rejected {
        publish: MqttPublish,
        pub_rec: MqttPubRec,
        error: MqttClientError,
    },
    /// QoS 2 publish received by the broker; PUBREL was sent. Not terminal.
    Qos2Intermediate(Qos2IntermediateResult),
    /// QoS 2 flow completed with PUBCOMP.
    ///
    /// `pub_rec` is only kept when no intermediate result was delivered.
    Qos2Complete {
        publish: MqttPublish,
        pub_rec: Option<MqttPubRec>,
        pub_rel: MqttPubRel,
        pub_comp: MqttPubComp,
    },
}

impl PublishResult {
    pub fn publish(&self) -> &MqttPublish {
        match self {
            PublishResult::Qos0 { publish, .. }
            | PublishResult::Qos1 { publish, .. }
            | PublishResult::Qos2Rejected { publish, .. }
            | PublishResult::Qos2Complete { publish, .. } => publish,
            PublishResult::Qos2Intermediate(intermediate) => &intermediate.publish,
        }
    }

    pub fn error(&self) -> Option<&MqttClientError> {
        match self {
            PublishResult::Qos0 { error, .. } | PublishResult::Qos1 { error, .. } => error.as_ref(),
            PublishResult::Qos2Rejected { error, .. } => Some(error),
            PublishResult::Qos2Intermediate(_) | PublishResult::Qos2Complete { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// Every result but the QoS 2 intermediate one ends its publish.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PublishResult::Qos2Intermediate(_))
    }
}

/// PUBREC received and PUBREL sent for a QoS 2 publish; PUBCOMP pending.
#[derive(Debug, Clone)]
pub struct Qos2IntermediateResult {
    pub publish: MqttPublish,
    pub pub_rec: MqttPubRec,
    completion: watch::Receiver<bool>,
}

impl Qos2IntermediateResult {
    pub(crate) fn new(publish: MqttPublish, pub_rec: MqttPubRec) -> (Self, Qos2Completion) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                publish,
                pub_rec,
                completion: rx,
            },
            Qos2Completion(tx),
        )
    }

    /// Whether PUBCOMP has been received.
    pub fn is_complete(&self) -> bool {
        *self.completion.borrow()
    }

    /// Waits for PUBCOMP. Returns `false` if the flow ended without it.
    pub async fn completed(&self) -> bool {
        let mut completion = self.completion.clone();
        let complete = completion.wait_for(|complete| *complete).await.is_ok();
        complete
    }
}

/// Handler-side half of a [`Qos2IntermediateResult`].
#[derive(Debug)]
pub struct Qos2Completion(watch::Sender<bool>);

impl Qos2Completion {
    /// Records PUBCOMP. Returns whether this call recorded it.
    pub fn complete(&self) -> bool {
        self.0.send_if_modified(|complete| {
            if *complete {
                false
            } else {
                *complete = true;
                true
            }
        })
    }
}

type ResultItem = Result<PublishResult, MqttClientError>;

#[derive(Debug)]
struct AckFlowInner {
    lifecycle: FlowLifecycle,
    results: mpsc::UnboundedSender<ResultItem>,
    /// Terminal results still expected
    remaining: AtomicUsize,
}

/// Handler-side result sink shared by the publishes of one publish call.
#[derive(Debug, Clone)]
pub struct AckFlow {
    inner: Arc<AckFlowInner>,
}

/// Creates the result sink for a publish call of `expected` publishes.
///
/// The sink leases `event_loop` until it is done or cancelled.
pub fn channel(event_loop: &EventLoopHandle, expected: usize) -> (AckFlow, PublishResults) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flow = AckFlow {
        inner: Arc::new(AckFlowInner {
            lifecycle: FlowLifecycle::new(event_loop.acquire()),
            results: tx,
            remaining: AtomicUsize::new(expected),
        }),
    };
    let results = PublishResults {
        rx,
        flow: flow.clone(),
        remaining: expected,
        finished: expected == 0,
    };
    (flow, results)
}

impl AckFlow {
    /// Links the flow to its first use. `false` if it was already cancelled.
    pub fn init(&self) -> bool {
        if !self.inner.lifecycle.init() {
            return false;
        }
        if self.inner.remaining.load(Ordering::Acquire) == 0 {
            self.inner.lifecycle.mark_done();
        }
        true
    }

    /// Delivers a result. Dropped if the flow is already done or cancelled.
    pub fn on_next(&self, result: PublishResult) {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.is_disposed() {
            return;
        }
        if !result.is_terminal() {
            let _ = self.inner.results.send(Ok(result));
            return;
        }

        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            // the last terminal result only goes out if completion wins over cancellation
            Ok(1) => {
                if lifecycle.mark_done() {
                    let _ = self.inner.results.send(Ok(result));
                }
            }
            Ok(_) => {
                let _ = self.inner.results.send(Ok(result));
            }
            Err(_) => {}
        }
    }

    /// Ends the whole flow with `error`.
    pub fn on_error(&self, error: MqttClientError) {
        if self.inner.lifecycle.mark_done() {
            let _ = self.inner.results.send(Err(error));
        }
    }

    pub fn cancel(&self) {
        self.inner.lifecycle.cancel(|| {
            tracing::trace!("publish flow cancelled");
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lifecycle.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lifecycle.is_disposed()
    }
}

/// A publish travelling with the result sink of its call.
#[derive(Debug, Clone)]
pub struct PublishWithFlow {
    pub publish: MqttPublish,
    pub flow: AckFlow,
}

impl PublishWithFlow {
    pub fn new(publish: MqttPublish, flow: AckFlow) -> Self {
        Self { publish, flow }
    }
}

/// Caller-side receiver of a publish call's results.
///
/// Yields every intermediate and terminal result. It ends after one terminal
/// result per publish, or after the first error, which ends the whole call.
/// Dropping it cancels the flow.
#[derive(Debug)]
pub struct PublishResults {
    rx: mpsc::UnboundedReceiver<ResultItem>,
    flow: AckFlow,
    remaining: usize,
    finished: bool,
}

impl PublishResults {
    pub async fn recv(&mut self) -> Option<ResultItem> {
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        self.track(item)
    }

    /// Non-blocking receive; `None` if nothing is ready or the call finished.
    pub fn try_recv(&mut self) -> Option<ResultItem> {
        if self.finished {
            return None;
        }
        let item = self.rx.try_recv().ok();
        match item {
            Some(item) => self.track(Some(item)),
            None => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Cancels the call. Results not yet delivered are discarded.
    pub fn cancel(&self) {
        self.flow.cancel();
    }

    fn track(&mut self, item: Option<ResultItem>) -> Option<ResultItem> {
        match &item {
            Some(Ok(result)) if result.is_terminal() => {
                self.remaining = self.remaining.saturating_sub(1);
                self.finished = self.remaining == 0;
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => self.finished = true,
        }
        item
    }
}

impl Stream for PublishResults {
    type Item = ResultItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(item) => Poll::Ready(this.track(item)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PublishResults {
    fn drop(&mut self) {
        self.flow.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qos1_result(id: u16) -> PublishResult {
        PublishResult::Qos1 {
            publish: MqttPublish::simple("t", b"x".to_vec(), 1),
            pub_ack: MqttPubAck::new_success(id),
            error: None,
        }
    }

    #[test]
    fn test_single_publish_terminal_result() {
        let (handle, _rx) = EventLoopHandle::new();
        let (flow, mut results) = channel(&handle, 1);
        assert!(flow.init());

        flow.on_next(qos1_result(1));
        // a late second terminal is dropped
        flow.on_next(qos1_result(1));

        let first = results.try_recv().unwrap().unwrap();
        assert!(first.is_success());
        assert!(results.is_finished());
        assert!(results.try_recv().is_none());
        assert_eq!(handle.active_leases(), 0);
    }

    #[test]
    fn test_intermediate_is_not_terminal() {
        let (handle, _rx) = EventLoopHandle::new();
        let (flow, mut results) = channel(&handle, 1);
        flow.init();

        let publish = MqttPublish::simple("t", b"x".to_vec(), 2);
        let (intermediate, completion) =
            Qos2IntermediateResult::new(publish.clone(), MqttPubRec::new_success(5));
        flow.on_next(PublishResult::Qos2Intermediate(intermediate));

        let item = results.try_recv().unwrap().unwrap();
        assert!(!item.is_terminal());
        assert!(!results.is_finished());
        let PublishResult::Qos2Intermediate(intermediate) = item else {
            panic!("Expected intermediate result");
        };
        assert!(!intermediate.is_complete());
        assert!(completion.complete());
        assert!(!completion.complete());
        assert!(intermediate.is_complete());
        assert_eq!(handle.active_leases(), 1);
    }

    #[test]
    fn test_error_ends_multi_publish_call() {
        let (handle, _rx) = EventLoopHandle::new();
        let (flow, mut results) = channel(&handle, 3);
        flow.init();

        flow.on_next(qos1_result(1));
        flow.on_error(MqttClientError::NotConnected);
        flow.on_next(qos1_result(2));

        assert!(results.try_recv().unwrap().is_ok());
        assert!(matches!(
            results.try_recv(),
            Some(Err(MqttClientError::NotConnected))
        ));
        assert!(results.is_finished());
        assert_eq!(handle.active_leases(), 0);
    }

    #[test]
    fn test_drop_cancels_flow() {
        let (handle, _rx) = EventLoopHandle::new();
        let (flow, results) = channel(&handle, 1);
        flow.init();
        drop(results);

        assert!(flow.is_cancelled());
        flow.on_next(qos1_result(1));
        assert_eq!(handle.active_leases(), 0);
    }

    #[test]
    fn test_empty_call_is_done_on_init() {
        let (handle, _rx) = EventLoopHandle::new();
        let (flow, results) = channel(&handle, 0);
        assert!(results.is_finished());
        assert!(flow.init());
        assert!(flow.is_disposed());
        assert_eq!(handle.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_completed_resolves_on_pubcomp() {
        let publish = MqttPublish::simple("t", b"x".to_vec(), 2);
        let (intermediate, completion) =
            Qos2IntermediateResult::new(publish, MqttPubRec::new_success(1));
        let waiter = tokio::spawn({
            let intermediate = intermediate.clone();
            async move { intermediate.completed().await }
        });
        completion.complete();
        assert!(waiter.await.unwrap());

        let (intermediate, completion) = Qos2IntermediateResult::new(
            MqttPublish::simple("t", b"x".to_vec(), 2),
            MqttPubRec::new_success(2),
        );
        drop(completion);
        assert!(!intermediate.completed().await);
    }
}
