// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A v5 session with a session expiry interval survives a disconnect and
//! receives messages queued while it was away.

use codec::{QoS, ReasonCode};
use std::time::Duration;

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_session_resume() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    // First connection subscribes and goes away.
    let mut subscriber = TestClient::dial(broker.addr).await;
    let ack = subscriber.connect_v5("c1", false, Some(60)).await;
    assert_eq!(ack.reason_code(), ReasonCode::Success);
    assert!(!ack.session_present());

    let sub_ack = subscriber.subscribe_v5("t/+", QoS::AtLeastOnce, 1).await;
    assert_eq!(sub_ack.reasons(), &[ReasonCode::GrantedQoS1]);

    subscriber.disconnect_v5().await;
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A publish while the subscriber is disconnected is queued in its
    // session.
    let mut publisher = TestClient::dial(broker.addr).await;
    publisher.connect_v5("pub", true, None).await;
    let pub_ack = publisher.publish_v5_qos1("t/x", b"hi", 7).await;
    assert_eq!(pub_ack.reason_code(), ReasonCode::Success);

    // Resume the session; the stored publish is delivered fresh.
    let mut subscriber = TestClient::dial(broker.addr).await;
    let ack = subscriber.connect_v5("c1", false, Some(60)).await;
    assert_eq!(ack.reason_code(), ReasonCode::Success);
    assert!(ack.session_present());

    let publish = subscriber.expect_publish_v5().await;
    assert_eq!(publish.topic(), "t/x");
    assert_eq!(publish.message().as_ref(), b"hi");
    assert_eq!(publish.qos(), QoS::AtLeastOnce);
    assert!(!publish.dup());
    assert_ne!(publish.packet_id().value(), 0);
    subscriber.puback(publish.packet_id()).await;

    broker.stop().await;
}
