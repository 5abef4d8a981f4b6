// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Wills fire on abnormal disconnect and are discarded on a graceful one.

use codec::QoS;
use std::time::Duration;

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_will_on_abnormal_disconnect() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut subscriber = TestClient::dial(broker.addr).await;
    subscriber.connect_v5("sub", true, None).await;
    subscriber.subscribe_v5("will/t", QoS::AtMostOnce, 1).await;

    let mut doomed = TestClient::dial(broker.addr).await;
    doomed
        .connect_v5_with_will("doomed", "will/t", b"gone", None)
        .await;

    // Dropping the socket without DISCONNECT is an abnormal termination.
    drop(doomed);

    let publish = subscriber.expect_publish_v5().await;
    assert_eq!(publish.topic(), "will/t");
    assert_eq!(publish.message().as_ref(), b"gone");

    broker.stop().await;
}

#[tokio::test]
async fn test_no_will_on_graceful_disconnect() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut subscriber = TestClient::dial(broker.addr).await;
    subscriber.connect_v5("sub", true, None).await;
    subscriber.subscribe_v5("will/t", QoS::AtMostOnce, 1).await;

    let mut polite = TestClient::dial(broker.addr).await;
    polite
        .connect_v5_with_will("polite", "will/t", b"gone", None)
        .await;
    polite.disconnect_v5().await;
    drop(polite);

    assert!(
        subscriber
            .try_recv_v5(Duration::from_millis(300))
            .await
            .is_none(),
        "will must not fire after a graceful disconnect"
    );

    broker.stop().await;
}
