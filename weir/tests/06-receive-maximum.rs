// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A broker configured with `receive_maximum = 1` rejects a second QoS 2
//! publish while the first exchange is incomplete.

use codec::ReasonCode;

mod common;
use common::{Broker, TestClient};

const CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"

[mqtt]
receive_maximum = 1

[log]
console_log = false
"#;

#[tokio::test]
async fn test_receive_maximum_exceeded() {
    let broker = Broker::start(CONFIG).await;

    let mut publisher = TestClient::dial(broker.addr).await;
    publisher.connect_v5("pub", true, None).await;

    let rec = publisher.publish_v5_qos2("t/a", b"one", 1).await;
    assert_eq!(rec.reason_code(), ReasonCode::Success);

    // The first exchange has not completed; a second QoS 2 publish
    // exceeds the receive maximum.
    let rec = publisher.publish_v5_qos2("t/b", b"two", 2).await;
    assert_eq!(rec.reason_code(), ReasonCode::ReceiveMaximumExceeded);

    // Completing the first flow frees the slot.
    publisher
        .send(&codec::v5::PublishReleasePacket::new(codec::PacketId::new(1)))
        .await;
    match publisher.recv_v5().await {
        codec::v5::Packet::PublishComplete(comp) => {
            assert_eq!(comp.packet_id().value(), 1);
        }
        packet => panic!("expected PUBCOMP, got {packet:?}"),
    }

    let rec = publisher.publish_v5_qos2("t/b", b"two", 2).await;
    assert_eq!(rec.reason_code(), ReasonCode::Success);

    broker.stop().await;
}
