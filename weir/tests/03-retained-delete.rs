// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A retained publish with an empty payload removes the stored message.

use codec::QoS;
use std::time::Duration;

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_retained_delete() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut publisher = TestClient::dial(broker.addr).await;
    publisher.connect_v5("pub", true, None).await;
    publisher.publish_v5_qos0("r", b"A", true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Positive control: the retained message is delivered at subscribe.
    let mut witness = TestClient::dial(broker.addr).await;
    witness.connect_v5("witness", true, None).await;
    witness.subscribe_v5("r", QoS::AtMostOnce, 1).await;
    let publish = witness.expect_publish_v5().await;
    assert_eq!(publish.message().as_ref(), b"A");
    assert!(publish.retain());

    // An empty retained payload deletes the stored message.
    publisher.publish_v5_qos0("r", b"", true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::dial(broker.addr).await;
    subscriber.connect_v5("sub", true, None).await;
    subscriber.subscribe_v5("r", QoS::AtMostOnce, 1).await;
    assert!(
        subscriber
            .try_recv_v5(Duration::from_millis(300))
            .await
            .is_none(),
        "no retained message expected after deletion"
    );

    broker.stop().await;
}
