// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use flowsdk_qos::mqtt_client::ack_flow::PublishResult;
use flowsdk_qos::mqtt_client::error::MqttClientError;
use flowsdk_qos::mqtt_client::opts::{ConnectionConfig, QosHandlerOptions};
use flowsdk_qos::mqtt_client::tokio_qos_client::{
    ChannelEventHandler, QosConnectionEvent, TokioQosClient,
};
use flowsdk_qos::mqtt_serde::control_packet::{ControlPacketType, MqttPacket};
use flowsdk_qos::mqtt_serde::mqttv5::pubackv5::MqttPubAck;
use flowsdk_qos::mqtt_serde::mqttv5::pubcompv5::MqttPubComp;
use flowsdk_qos::mqtt_serde::mqttv5::publishv5::MqttPublish;
use flowsdk_qos::mqtt_serde::mqttv5::pubrecv5::MqttPubRec;
use flowsdk_qos::mqtt_serde::reason_code;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(2);

fn setup_client(options: QosHandlerOptions) -> (TokioQosClient, mpsc::UnboundedReceiver<QosConnectionEvent>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (handler, events) = ChannelEventHandler::new();
    (TokioQosClient::new(options, Box::new(handler)), events)
}

async fn next_packet(egress: &mut mpsc::Receiver<MqttPacket>) -> MqttPacket {
    timeout(WAIT, egress.recv())
        .await
        .expect("timed out waiting for egress packet")
        .expect("egress closed")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<QosConnectionEvent>) -> QosConnectionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_qos1_publish_round_trip() {
    let (client, _events) = setup_client(QosHandlerOptions::default());
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish(MqttPublish::simple("sensors/temp", b"21".to_vec(), 1));

    match next_packet(&mut egress).await {
        MqttPacket::Publish(p) => {
            assert_eq!(p.topic_name, "sensors/temp");
            assert_eq!(p.packet_id, Some(1));
            assert_eq!(p.qos, 1);
        }
        other => panic!("Expected publish, got {:?}", other),
    }

    client
        .handle_inbound(MqttPacket::PubAck(MqttPubAck::new_success(1)))
        .unwrap();

    match timeout(WAIT, results.recv()).await.unwrap() {
        Some(Ok(PublishResult::Qos1 { pub_ack, error, .. })) => {
            assert_eq!(pub_ack.packet_id, 1);
            assert!(error.is_none());
        }
        other => panic!("Expected QoS 1 result, got {:?}", other),
    }
    assert!(results.recv().await.is_none());
    assert_eq!(client.active_flows(), 0);
}

#[tokio::test]
async fn test_publish_without_session_fails_immediately() {
    let (client, _events) = setup_client(QosHandlerOptions::default());

    let mut results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 1));
    assert!(matches!(
        results.recv().await,
        Some(Err(MqttClientError::NotConnected))
    ));
    assert!(results.is_finished());
}

#[tokio::test]
async fn test_qos2_intermediate_result_observes_completion() {
    let (client, _events) = setup_client(QosHandlerOptions::default());
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 2));
    assert_eq!(next_packet(&mut egress).await.packet_id(), Some(1));

    client
        .handle_inbound(MqttPacket::PubRec(MqttPubRec::new_success(1)))
        .unwrap();
    let intermediate = match timeout(WAIT, results.recv()).await.unwrap() {
        Some(Ok(PublishResult::Qos2Intermediate(intermediate))) => intermediate,
        other => panic!("Expected intermediate result, got {:?}", other),
    };
    assert_eq!(
        next_packet(&mut egress).await.packet_type(),
        ControlPacketType::PUBREL
    );

    let waiter = tokio::spawn({
        let intermediate = intermediate.clone();
        async move { intermediate.completed().await }
    });
    client
        .handle_inbound(MqttPacket::PubComp(MqttPubComp::new_success(1)))
        .unwrap();

    assert!(timeout(WAIT, waiter).await.unwrap().unwrap());
    assert!(matches!(
        timeout(WAIT, results.recv()).await.unwrap(),
        Some(Ok(PublishResult::Qos2Complete { .. }))
    ));
}

#[tokio::test]
async fn test_unknown_ack_disconnects_with_protocol_error() {
    let (client, mut events) = setup_client(QosHandlerOptions::default());
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    client
        .handle_inbound(MqttPacket::PubAck(MqttPubAck::new_success(7)))
        .unwrap();

    match next_packet(&mut egress).await {
        MqttPacket::Disconnect(d) => assert_eq!(d.reason_code, reason_code::PROTOCOL_ERROR),
        other => panic!("Expected disconnect, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut events).await,
        QosConnectionEvent::ProtocolError(_)
    ));
}

#[tokio::test]
async fn test_unhandled_packets_are_forwarded() {
    let (client, mut events) = setup_client(QosHandlerOptions::default());
    let _egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let ping = MqttPacket::Other {
        packet_type: ControlPacketType::PINGRESP,
        body: Vec::new(),
    };
    client.handle_inbound(ping.clone()).unwrap();

    match next_event(&mut events).await {
        QosConnectionEvent::Passthrough(packet) => assert_eq!(packet, ping),
        other => panic!("Expected passthrough, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_egress_fails_publish_locally() {
    let options = QosHandlerOptions::builder().egress_capacity(1).build();
    let (client, mut events) = setup_client(options);
    let _egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish_all(vec![
        MqttPublish::simple("a", b"1".to_vec(), 0),
        MqttPublish::simple("b", b"2".to_vec(), 0),
    ]);

    let first = timeout(WAIT, results.recv()).await.unwrap().unwrap().unwrap();
    assert!(first.is_success());
    let second = timeout(WAIT, results.recv()).await.unwrap().unwrap().unwrap();
    assert!(matches!(
        second.error(),
        Some(MqttClientError::BufferFull { capacity: 1, .. })
    ));
    assert!(results.is_finished());
    // a full buffer is not a connection failure
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_closed_egress_is_escalated() {
    let (client, mut events) = setup_client(QosHandlerOptions::default());
    let egress = client.start_session(ConnectionConfig::new(10)).unwrap();
    drop(egress);

    let _results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 1));

    match next_event(&mut events).await {
        QosConnectionEvent::Exception(error) => assert!(error.is_network_error()),
        other => panic!("Expected exception, got {:?}", other),
    }
}

#[tokio::test]
async fn test_end_session_fails_outstanding_publishes() {
    let (client, _events) = setup_client(QosHandlerOptions::default());
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 1));
    next_packet(&mut egress).await;

    client.channel_inactive().unwrap();
    client.end_session(MqttClientError::NotConnected).unwrap();

    assert!(matches!(
        timeout(WAIT, results.recv()).await.unwrap(),
        Some(Err(MqttClientError::NotConnected))
    ));
    assert_eq!(client.active_flows(), 0);
}

#[tokio::test]
async fn test_results_as_stream() {
    let (client, _events) = setup_client(QosHandlerOptions::default());
    let _egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let results = client.publish_all(
        (0..3)
            .map(|i| MqttPublish::simple(format!("t/{}", i), b"x".to_vec(), 0))
            .collect(),
    );
    let collected: Vec<_> = timeout(WAIT, results.collect::<Vec<_>>()).await.unwrap();

    assert_eq!(collected.len(), 3);
    let topics: Vec<String> = collected
        .into_iter()
        .map(|r| r.unwrap().publish().topic_name.clone())
        .collect();
    assert_eq!(topics, vec!["t/0", "t/1", "t/2"]);
}

#[tokio::test]
async fn test_shutdown_fails_outstanding_publishes() {
    let (client, _events) = setup_client(QosHandlerOptions::default());
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 1));
    next_packet(&mut egress).await;

    client.shutdown();
    assert!(matches!(
        timeout(WAIT, results.recv()).await.unwrap(),
        Some(Err(MqttClientError::NotConnected))
    ));
}

#[tokio::test]
async fn test_protocol_error_is_reported_when_egress_is_full() {
    let options = QosHandlerOptions::builder().egress_capacity(1).build();
    let (client, mut events) = setup_client(options);
    let mut egress = client.start_session(ConnectionConfig::new(10)).unwrap();

    let mut results = client.publish(MqttPublish::simple("t", b"x".to_vec(), 0));
    let written = timeout(WAIT, results.recv()).await.unwrap().unwrap().unwrap();
    assert!(written.is_success());

    client
        .handle_inbound(MqttPacket::PubAck(MqttPubAck::new_success(9)))
        .unwrap();

    match next_event(&mut events).await {
        QosConnectionEvent::ProtocolError(d) => assert_eq!(d.reason_code, reason_code::PROTOCOL_ERROR),
        other => panic!("Expected protocol error, got {:?}", other),
    }
    // only the publish fit, the DISCONNECT was dropped
    assert_eq!(next_packet(&mut egress).await.packet_type(), ControlPacketType::PUBLISH);
    assert!(egress.try_recv().is_err());
}
