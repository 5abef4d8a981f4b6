// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Messages to a shared subscription group go to exactly one member each,
//! round robin by least recent delivery.

use codec::QoS;
use std::time::Duration;

mod common;
use common::{Broker, TestClient, DEFAULT_CONFIG};

#[tokio::test]
async fn test_shared_subscription_round_robin() {
    let broker = Broker::start(DEFAULT_CONFIG).await;

    let mut worker_a = TestClient::dial(broker.addr).await;
    worker_a.connect_v5("worker-a", true, None).await;
    worker_a
        .subscribe_v5("$share/g/t/#", QoS::AtMostOnce, 1)
        .await;

    let mut worker_b = TestClient::dial(broker.addr).await;
    worker_b.connect_v5("worker-b", true, None).await;
    worker_b
        .subscribe_v5("$share/g/t/#", QoS::AtMostOnce, 1)
        .await;

    let mut publisher = TestClient::dial(broker.addr).await;
    publisher.connect_v5("pub", true, None).await;
    for payload in [b"m1", b"m2", b"m3"] {
        publisher.publish_v5_qos0("t/x", payload, false).await;
    }

    // Exactly three deliveries in total, each message to one worker only.
    let mut received_a = Vec::new();
    let mut received_b = Vec::new();
    let deadline = Duration::from_millis(500);
    while let Some(packet) = worker_a.try_recv_v5(deadline).await {
        if let codec::v5::Packet::Publish(publish) = packet {
            received_a.push(publish.message().clone());
        }
    }
    while let Some(packet) = worker_b.try_recv_v5(deadline).await {
        if let codec::v5::Packet::Publish(publish) = packet {
            received_b.push(publish.message().clone());
        }
    }

    assert_eq!(received_a.len() + received_b.len(), 3);
    let mut all: Vec<&[u8]> = received_a
        .iter()
        .chain(received_b.iter())
        .map(AsRef::as_ref)
        .collect();
    all.sort();
    assert_eq!(all, vec![&b"m1"[..], &b"m2"[..], &b"m3"[..]]);

    // Round robin: with two members and three messages neither worker
    // saw everything.
    assert!(!received_a.is_empty());
    assert!(!received_b.is_empty());

    broker.stop().await;
}
