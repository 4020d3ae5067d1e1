// SPDX-License-Identifier: MPL-2.0

//! The multiplexed supplier of outgoing publishes.
//!
//! Publish calls from any thread add their publishes to a [`PublishSource`];
//! the outgoing QoS handler subscribes once and pulls under explicit demand
//! (`request(n)`), so no more publishes are handed over than it can put in
//! flight.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::mqtt_serde::mqttv5::publish::MqttPublish;

use super::ack_flow::{AckFlow, PublishWithFlow};
use super::error::MqttClientError;

/// Receives publishes from a [`PublishSource`].
pub trait PublishSubscriber: Send + Sync {
    fn on_next(&self, publish: PublishWithFlow);

    /// The source completed. A live source never does.
    fn on_complete(&self);

    /// The source failed. A live source never does.
    fn on_error(&self, error: MqttClientError);
}

/// Demand channel from a subscriber back to its source.
pub trait Subscription: Send + Sync {
    fn request(&self, n: usize);
}

pub trait PublishSource: Send + Sync {
    /// Attaches `subscriber`. Nothing is emitted until demand is requested.
    fn subscribe(&self, subscriber: Arc<dyn PublishSubscriber>) -> Arc<dyn Subscription>;
}

#[derive(Default)]
struct FlowablesState {
    subscriber: Option<Arc<dyn PublishSubscriber>>,
    demand: usize,
    pending: VecDeque<PublishWithFlow>,
}

/// Default [`PublishSource`]: merges every publish call into one ordered
/// stream.
///
/// Publishes of a cancelled call that are still pending are skipped without
/// consuming demand.
#[derive(Clone, Default)]
pub struct PublishFlowables {
    state: Arc<Mutex<FlowablesState>>,
}

impl PublishFlowables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the publishes of one call, all resolved through `flow`.
    ///
    /// Returns `false` if the flow was cancelled before it could be linked;
    /// its publishes are dropped then.
    pub fn add(&self, publishes: Vec<MqttPublish>, flow: AckFlow) -> bool {
        if !flow.init() {
            trace!("publish flow cancelled before it was linked");
            return false;
        }
        let mut state = self.lock();
        state.pending.extend(
            publishes
                .into_iter()
                .map(|publish| PublishWithFlow::new(publish, flow.clone())),
        );
        Self::drain(&mut state);
        true
    }

    /// Publishes added but not yet handed to the subscriber.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Outstanding demand of the subscriber.
    pub fn demand(&self) -> usize {
        self.lock().demand
    }

    fn lock(&self) -> MutexGuard<'_, FlowablesState> {
        lock_state(&self.state)
    }

    fn drain(state: &mut FlowablesState) {
        let Some(subscriber) = state.subscriber.clone() else {
            return;
        };
        while state.demand > 0 {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            if next.flow.is_disposed() {
                continue;
            }
            state.demand -= 1;
            subscriber.on_next(next);
        }
    }
}

impl PublishSource for PublishFlowables {
    fn subscribe(&self, subscriber: Arc<dyn PublishSubscriber>) -> Arc<dyn Subscription> {
        let mut state = self.lock();
        state.subscriber = Some(subscriber);
        Arc::new(FlowablesSubscription {
            state: Arc::clone(&self.state),
        })
    }
}

impl std::fmt::Debug for PublishFlowables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PublishFlowables")
            .field("subscribed", &state.subscriber.is_some())
            .field("demand", &state.demand)
            .field("pending", &state.pending.len())
            .finish()
    }
}

struct FlowablesSubscription {
    state: Arc<Mutex<FlowablesState>>,
}

impl Subscription for FlowablesSubscription {
    fn request(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = lock_state(&self.state);
        state.demand = state.demand.saturating_add(n);
        PublishFlowables::drain(&mut state);
    }
}

// Subscribers never panic while the lock is held, a poisoned state is still consistent.
fn lock_state(state: &Mutex<FlowablesState>) -> MutexGuard<'_, FlowablesState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_client::ack_flow;
    use crate::mqtt_client::event_loop::EventLoopHandle;

    #[derive(Default)]
    struct Collect(Mutex<Vec<PublishWithFlow>>);

    impl PublishSubscriber for Collect {
        fn on_next(&self, publish: PublishWithFlow) {
            self.0.lock().unwrap().push(publish);
        }
        fn on_complete(&self) {}
        fn on_error(&self, _error: MqttClientError) {}
    }

    fn topics(collect: &Collect) -> Vec<String> {
        collect
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.publish.topic_name.clone())
            .collect()
    }

    #[test]
    fn test_emits_only_under_demand_in_order() {
        let (handle, _rx) = EventLoopHandle::new();
        let source = PublishFlowables::new();
        let collect = Arc::new(Collect::default());
        let subscription = source.subscribe(collect.clone());

        let (flow, _results) = ack_flow::channel(&handle, 3);
        assert!(source.add(
            vec![
                MqttPublish::simple("a", b"1".to_vec(), 1),
                MqttPublish::simple("b", b"2".to_vec(), 1),
                MqttPublish::simple("c", b"3".to_vec(), 1),
            ],
            flow,
        ));
        assert!(topics(&collect).is_empty());
        assert_eq!(source.pending_len(), 3);

        subscription.request(2);
        assert_eq!(topics(&collect), vec!["a", "b"]);
        assert_eq!(source.demand(), 0);

        subscription.request(5);
        assert_eq!(topics(&collect), vec!["a", "b", "c"]);
        assert_eq!(source.demand(), 4);
    }

    #[test]
    fn test_cancelled_flow_is_skipped_without_consuming_demand() {
        let (handle, _rx) = EventLoopHandle::new();
        let source = PublishFlowables::new();
        let collect = Arc::new(Collect::default());
        let subscription = source.subscribe(collect.clone());

        let (flow_a, results_a) = ack_flow::channel(&handle, 1);
        let (flow_b, _results_b) = ack_flow::channel(&handle, 1);
        source.add(vec![MqttPublish::simple("a", b"1".to_vec(), 1)], flow_a);
        source.add(vec![MqttPublish::simple("b", b"2".to_vec(), 1)], flow_b);
        drop(results_a);

        subscription.request(1);
        assert_eq!(topics(&collect), vec!["b"]);
        assert_eq!(source.pending_len(), 0);
    }

    #[test]
    fn test_flow_cancelled_before_add_is_dropped() {
        let (handle, _rx) = EventLoopHandle::new();
        let source = PublishFlowables::new();
        let (flow, results) = ack_flow::channel(&handle, 1);
        results.cancel();

        assert!(!source.add(vec![MqttPublish::simple("a", b"1".to_vec(), 0)], flow));
        assert_eq!(source.pending_len(), 0);
        assert_eq!(handle.active_leases(), 0);
    }
}
