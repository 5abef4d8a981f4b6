// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A second CONNECT with the same client id takes the session over and the
//! first connection is told so.

use codec::ReasonCode;

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_session_taken_over() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut first = TestClient::dial(broker.addr).await;
    let ack = first.connect_v5("c1", true, None).await;
    assert_eq!(ack.reason_code(), ReasonCode::Success);

    let mut second = TestClient::dial(broker.addr).await;
    let ack = second.connect_v5("c1", true, None).await;
    assert_eq!(ack.reason_code(), ReasonCode::Success);
    assert!(!ack.session_present());

    // The first connection receives DISCONNECT with SessionTakenOver.
    match first.recv_v5().await {
        codec::v5::Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code(), ReasonCode::SessionTakenOver);
        }
        packet => panic!("expected DISCONNECT, got {packet:?}"),
    }

    broker.stop().await;
}
