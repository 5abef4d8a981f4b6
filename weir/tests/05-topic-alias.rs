// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic aliases bind a topic within one connection; alias 0 is invalid.

use codec::{QoS, ReasonCode};

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_topic_alias() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut subscriber = TestClient::dial(broker.addr).await;
    subscriber.connect_v5("sub", true, None).await;
    subscriber
        .subscribe_v5("long/topic", QoS::AtMostOnce, 1)
        .await;

    let mut publisher = TestClient::dial(broker.addr).await;
    publisher.connect_v5("pub", true, None).await;

    // Bind alias 1 with a full topic, then publish by alias alone.
    publisher.publish_v5_alias("long/topic", 1, b"first").await;
    publisher.publish_v5_alias("", 1, b"second").await;

    let publish = subscriber.expect_publish_v5().await;
    assert_eq!(publish.topic(), "long/topic");
    assert_eq!(publish.message().as_ref(), b"first");

    let publish = subscriber.expect_publish_v5().await;
    assert_eq!(publish.topic(), "long/topic");
    assert_eq!(publish.message().as_ref(), b"second");

    // Alias 0 is a protocol violation.
    publisher.publish_v5_alias("long/topic", 0, b"third").await;
    match publisher.recv_v5().await {
        codec::v5::Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::TopicAliasInvalid);
        }
        packet => panic!("expected DISCONNECT, got {packet:?}"),
    }

    broker.stop().await;
}
