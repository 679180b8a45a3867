// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

mod common;

use common::*;
use mqttsn_gateway::engine::CoreError;
use mqttsn_gateway::packet::{Message, MessageType, QosLevel, ReturnCode, TopicIdType};
use mqttsn_gateway::session_store::{ClientStatus, DeviceAddress, StoreLimits, Will};

/// Connected client subscribed to `topic` at QoS 1, returns the topic id
fn subscribe(engine: &mut TestEngine, client: u8, topic: &str) -> u16 {
    let address = client_address(client);
    let topic_id = engine.register_topic(&address, topic).unwrap();
    assert_eq!(
        engine.add_subscription(&address, topic_id, TopicIdType::Normal, QosLevel::AtLeastOnce),
        Ok((topic_id, 1))
    );
    topic_id
}

fn published_msg_id(sent: &[(DeviceAddress, Message)]) -> u16 {
    match sent {
        [(_, Message::Publish { msg_id, .. })] => *msg_id,
        other => panic!("expected a single PUBLISH, got {other:?}"),
    }
}

#[test]
fn test_add_client_is_active() {
    let mut engine = new_engine();
    let address = client_address(1);

    assert_eq!(engine.add_client("sensor1", 60, true, &address), Ok(()));

    let session = engine.store().session("sensor1").unwrap();
    assert_eq!(session.status, ClientStatus::Active);
    assert_eq!(session.duration, 60_000);
    assert_eq!(session.timeout, 0);
    assert_eq!(session.address, address);
    assert_eq!(session.awaited_message_type, MessageType::PingReq);
}

#[test]
fn test_add_client_rejected_while_broker_offline() {
    let mut engine = new_engine();
    engine.notify_mqtt_disconnected();

    assert_eq!(
        engine.add_client("sensor1", 60, true, &client_address(1)),
        Err(CoreError::Zero)
    );
    assert_eq!(engine.store().session_count(), 0);
}

#[test]
fn test_add_client_table_full() {
    let limits = StoreLimits {
        max_clients: 1,
        ..StoreLimits::default()
    };
    let mut engine = engine_with_store(new_store(limits), engine_config());

    assert_eq!(engine.add_client("sensor1", 60, true, &client_address(1)), Ok(()));
    assert_eq!(
        engine.add_client("sensor2", 60, true, &client_address(2)),
        Err(CoreError::Full)
    );
    // reconnecting an existing client does not need a new slot
    assert_eq!(engine.add_client("sensor1", 60, false, &client_address(3)), Ok(()));
    assert_eq!(
        engine.store().session("sensor1").unwrap().address,
        client_address(3)
    );
}

#[test]
fn test_reused_address_evicts_disconnected_session() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("old", 60, true, &address).unwrap();
    subscribe(&mut engine, 1, "room/temp");
    engine.set_disconnected(&address).unwrap();

    for _ in 0..3 {
        engine.system_mut().set_beat(60_000);
        engine.tick();
    }
    assert_eq!(
        engine.store().session("old").unwrap().status,
        ClientStatus::Disconnected
    );

    assert_eq!(engine.add_client("new", 60, true, &address), Ok(()));
    assert!(engine.store().session("old").is_none());
    assert_eq!(engine.store().session_by_address(&address).unwrap().client_id, "new");
    assert_eq!(engine.store().subscription_count("room/temp"), 0);
    assert_eq!(engine.broker().unsubscribes, vec!["room/temp".to_string()]);

    // a connected holder keeps its address
    assert_eq!(
        engine.add_client("other", 60, true, &address),
        Err(CoreError::Zero)
    );
    assert_eq!(engine.store().session("new").unwrap().status, ClientStatus::Active);
}

#[test]
fn test_first_subscription_subscribes_upstream_once() {
    let mut engine = new_engine();
    engine.add_client("sensor1", 60, true, &client_address(1)).unwrap();
    engine.add_client("sensor2", 60, true, &client_address(2)).unwrap();

    subscribe(&mut engine, 1, "room/temp");
    assert_eq!(engine.store().subscription_count("room/temp"), 1);
    assert_eq!(
        engine.broker().subscribes,
        vec![("room/temp".to_string(), 1)]
    );

    subscribe(&mut engine, 2, "room/temp");
    assert_eq!(engine.store().subscription_count("room/temp"), 2);
    assert_eq!(engine.broker().subscribes.len(), 1);

    // subscribing twice does not count twice
    subscribe(&mut engine, 2, "room/temp");
    assert_eq!(engine.store().subscription_count("room/temp"), 2);

    engine
        .delete_subscription_by_name(&client_address(1), "room/temp")
        .unwrap();
    assert_eq!(engine.store().subscription_count("room/temp"), 1);
    assert!(engine.broker().unsubscribes.is_empty());

    engine
        .delete_subscription_by_name(&client_address(2), "room/temp")
        .unwrap();
    assert_eq!(engine.store().subscription_count("room/temp"), 0);
    assert_eq!(engine.broker().unsubscribes, vec!["room/temp".to_string()]);
}

#[test]
fn test_failed_upstream_subscribe_rolls_back() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    let topic_id = engine.register_topic(&address, "room/temp").unwrap();

    engine.broker_mut().fail = true;
    assert_eq!(
        engine.add_subscription(&address, topic_id, TopicIdType::Normal, QosLevel::AtLeastOnce),
        Err(CoreError::Zero)
    );
    assert_eq!(engine.store().subscription_count("room/temp"), 0);
    assert!(
        engine
            .store()
            .session("sensor1")
            .unwrap()
            .subscriptions
            .is_empty()
    );
}

#[test]
fn test_subscription_unknown_topic_id() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();

    assert_eq!(
        engine.add_subscription(&address, 42, TopicIdType::Normal, QosLevel::AtMostOnce),
        Err(CoreError::TopicIdNonexistence)
    );
    assert_eq!(
        engine.add_subscription(&address, 42, TopicIdType::Predefined, QosLevel::AtMostOnce),
        Err(CoreError::TopicIdNonexistence)
    );
    assert_eq!(
        engine.add_subscription(&client_address(9), 1, TopicIdType::Predefined, QosLevel::AtMostOnce),
        Err(CoreError::ClientNonexistence)
    );
}

#[test]
fn test_short_topic_ids_must_be_utf8() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();

    let short = u16::from_be_bytes(*b"t1");
    assert_eq!(
        engine.add_subscription(&address, short, TopicIdType::Short, QosLevel::AtMostOnce),
        Ok((short, 0))
    );
    assert_eq!(engine.broker().subscribes, vec![("t1".to_string(), 0)]);

    assert_eq!(
        engine.add_subscription(&address, 0xfffe, TopicIdType::Short, QosLevel::AtMostOnce),
        Err(CoreError::TopicIdNonexistence)
    );
    assert_eq!(
        engine.publish(
            &address,
            b"x",
            0,
            0xfffe,
            TopicIdType::Short,
            false,
            QosLevel::AtMostOnce,
            false
        ),
        Err(CoreError::TopicIdNonexistence)
    );
    assert!(engine.broker().publishes.is_empty());
    assert_eq!(engine.broker().subscribes.len(), 1);
}

#[test]
fn test_register_topic_is_idempotent() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();

    let first = engine.register_topic(&address, "room/temp").unwrap();
    let second = engine.register_topic(&address, "room/temp").unwrap();
    let other = engine.register_topic(&address, "room/hum").unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_ne!(first, 0);
}

#[test]
fn test_broker_publish_delivered_with_qos1() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    let topic_id = subscribe(&mut engine, 1, "room/temp");

    engine.receive_broker_publish("room/temp", &[7u8; 10], false);
    let session = engine.store().session("sensor1").unwrap();
    assert_eq!(session.publishes.len(), 1);
    assert_eq!(session.publishes[0].payload, vec![7u8; 10]);

    engine.tick();
    let sent = engine.transport_mut().take_sent();
    let msg_id = published_msg_id(&sent);
    assert_ne!(msg_id, 0);
    match &sent[0].1 {
        Message::Publish {
            flags,
            topic_id: sent_topic_id,
            data,
            ..
        } => {
            assert_eq!(flags.qos, Some(QosLevel::AtLeastOnce));
            assert!(!flags.dup);
            assert_eq!(*sent_topic_id, topic_id);
            assert_eq!(data, &vec![7u8; 10]);
        }
        other => panic!("unexpected {other:?}"),
    }

    let session = engine.store().session("sensor1").unwrap();
    assert_eq!(session.awaited_message_type, MessageType::Puback);
    assert_eq!(session.awaited_message_id, msg_id);
    assert_eq!(session.publishes.len(), 1);
    assert_eq!(session.in_flight_count(), 1);

    assert_eq!(
        engine.notify_puback_arrived(&address, topic_id, msg_id, ReturnCode::Accepted),
        Ok(())
    );
    let session = engine.store().session("sensor1").unwrap();
    assert!(session.publishes.is_empty());
    assert_eq!(session.awaited_message_type, MessageType::PingReq);
}

#[test]
fn test_single_publish_in_flight() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    let topic_id = subscribe(&mut engine, 1, "room/temp");

    engine.receive_broker_publish("room/temp", b"first", false);
    engine.receive_broker_publish("room/temp", b"second", false);

    engine.tick();
    let first = published_msg_id(&engine.transport_mut().take_sent());

    engine.tick();
    engine.tick();
    assert!(engine.transport_mut().take_sent().is_empty());
    assert_eq!(engine.store().session("sensor1").unwrap().in_flight_count(), 1);

    // a PUBACK for another msg_id does not release the entry
    assert_eq!(
        engine.notify_puback_arrived(&address, topic_id, first.wrapping_add(1), ReturnCode::Accepted),
        Err(CoreError::Zero)
    );
    engine
        .notify_puback_arrived(&address, topic_id, first, ReturnCode::Accepted)
        .unwrap();

    engine.tick();
    let sent = engine.transport_mut().take_sent();
    let second = published_msg_id(&sent);
    assert_ne!(first, second);
    match &sent[0].1 {
        Message::Publish { data, .. } => assert_eq!(data, b"second"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_qos0_delivery_leaves_the_queue() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    let topic_id = engine.register_topic(&address, "room/temp").unwrap();
    engine
        .add_subscription(&address, topic_id, TopicIdType::Normal, QosLevel::AtMostOnce)
        .unwrap();

    engine.receive_broker_publish("room/temp", b"21.5", true);
    engine.tick();

    let sent = engine.transport_mut().take_sent();
    assert_eq!(published_msg_id(&sent), 0);
    match &sent[0].1 {
        Message::Publish { flags, .. } => {
            assert_eq!(flags.qos, Some(QosLevel::AtMostOnce));
            assert!(flags.retain);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.store().session("sensor1").unwrap().publishes.is_empty());
}

#[test]
fn test_wildcard_match_registers_topic_first() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    assert_eq!(
        engine.add_wildcard_subscription(&address, "room/+", QosLevel::AtLeastOnce),
        Ok((0, 1))
    );
    assert_eq!(engine.broker().subscribes, vec![("room/+".to_string(), 1)]);

    engine.receive_broker_publish("room/hum", b"40", false);
    engine.receive_broker_publish("hall/hum", b"41", false);
    assert_eq!(engine.store().session("sensor1").unwrap().publishes.len(), 1);

    engine.tick();
    let sent = engine.transport_mut().take_sent();
    let (topic_id, msg_id) = match sent.as_slice() {
        [(
            _,
            Message::Register {
                topic_id,
                msg_id,
                topic_name,
            },
        )] => {
            assert_eq!(topic_name, "room/hum");
            (*topic_id, *msg_id)
        }
        other => panic!("expected REGISTER, got {other:?}"),
    };
    assert_eq!(
        engine.store().session("sensor1").unwrap().awaited_message_type,
        MessageType::Regack
    );

    engine
        .notify_regack_arrived(&address, topic_id, msg_id, ReturnCode::Accepted)
        .unwrap();
    engine.tick();
    let sent = engine.transport_mut().take_sent();
    published_msg_id(&sent);
    match &sent[0].1 {
        Message::Publish {
            topic_id: sent_topic_id,
            ..
        } => assert_eq!(*sent_topic_id, topic_id),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_overlapping_filters_queue_one_copy_per_client() {
    let mut engine = new_engine();
    engine.add_client("sensor1", 60, true, &client_address(1)).unwrap();
    engine.add_client("sensor2", 60, true, &client_address(2)).unwrap();
    engine
        .add_wildcard_subscription(&client_address(1), "room/#", QosLevel::AtLeastOnce)
        .unwrap();
    subscribe(&mut engine, 2, "room/temp");
    let queued = |engine: &TestEngine, client_id: &str| {
        engine.store().session(client_id).unwrap().publishes.len()
    };

    // one copy per matching upstream subscription
    engine.receive_broker_publish_for("room/temp", &["room/#".to_string()], b"1", false);
    engine.receive_broker_publish_for("room/temp", &["room/temp".to_string()], b"1", false);
    assert_eq!(queued(&engine, "sensor1"), 1);
    assert_eq!(queued(&engine, "sensor2"), 1);

    // a single copy naming both filters
    engine.receive_broker_publish_for(
        "room/temp",
        &["room/temp".to_string(), "room/#".to_string()],
        b"2",
        false,
    );
    assert_eq!(queued(&engine, "sensor1"), 2);
    assert_eq!(queued(&engine, "sensor2"), 2);

    // a copy for a filter nobody holds any more
    engine.receive_broker_publish_for("room/temp", &["gone/#".to_string()], b"3", false);
    assert_eq!(queued(&engine, "sensor1"), 2);
    assert_eq!(queued(&engine, "sensor2"), 2);
}

#[test]
fn test_regack_congestion_retries_register() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    engine
        .add_wildcard_subscription(&address, "room/#", QosLevel::AtMostOnce)
        .unwrap();
    engine.receive_broker_publish("room/1/temp", b"20", false);

    engine.tick();
    let (topic_id, msg_id) = match engine.transport_mut().take_sent().as_slice() {
        [(_, Message::Register { topic_id, msg_id, .. })] => (*topic_id, *msg_id),
        other => panic!("expected REGISTER, got {other:?}"),
    };
    engine
        .notify_regack_arrived(&address, topic_id, msg_id, ReturnCode::RejectedCongestion)
        .unwrap();

    engine.tick();
    match engine.transport_mut().take_sent().as_slice() {
        [(_, Message::Register { topic_id: again, .. })] => assert_eq!(*again, topic_id),
        other => panic!("expected REGISTER again, got {other:?}"),
    }
}

#[test]
fn test_clean_session_reconnect_drops_subscriptions() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    subscribe(&mut engine, 1, "room/temp");

    // persistent reconnect keeps the subscription
    engine.add_client("sensor1", 60, false, &address).unwrap();
    assert_eq!(engine.store().subscription_count("room/temp"), 1);
    assert!(engine.broker().unsubscribes.is_empty());

    engine.add_client("sensor1", 60, true, &address).unwrap();
    let session = engine.store().session("sensor1").unwrap();
    assert!(session.subscriptions.is_empty());
    assert!(session.registrations.is_empty());
    assert_eq!(engine.store().subscription_count("room/temp"), 0);
    assert_eq!(engine.broker().unsubscribes, vec!["room/temp".to_string()]);
}

#[test]
fn test_keepalive_expiry_publishes_will_and_cleans_up() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 30, true, &address).unwrap();
    engine.await_message(&address, MessageType::WillTopic).unwrap();
    engine
        .add_will_topic(&address, "sensors/1/state", 1, true)
        .unwrap();
    engine.add_will_msg(&address, b"gone").unwrap();
    subscribe(&mut engine, 1, "room/temp");

    // a publish stays in flight, nobody answers
    engine.receive_broker_publish("room/temp", b"x", false);
    engine.tick();
    assert_eq!(engine.transport_mut().take_sent().len(), 1);

    engine.system_mut().set_beat(20_000);
    engine.tick();
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 20_000);

    engine.system_mut().set_beat(20_000);
    engine.tick();
    // 40000 ms is still within the 45000 ms tolerance
    assert_eq!(
        engine.store().session("sensor1").unwrap().status,
        ClientStatus::Active
    );

    engine.system_mut().set_beat(20_000);
    engine.tick();
    assert!(engine.store().session("sensor1").is_none());
    assert_eq!(engine.store().subscription_count("room/temp"), 0);
    assert_eq!(engine.broker().unsubscribes, vec!["room/temp".to_string()]);
    assert_eq!(
        engine.broker().publishes,
        vec![("sensors/1/state".to_string(), b"gone".to_vec(), 1, true)]
    );

    engine.system_mut().set_beat(20_000);
    engine.tick();
    assert_eq!(engine.broker().publishes.len(), 1);
}

#[test]
fn test_keepalive_tolerance_boundary_for_long_duration() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 120, true, &address).unwrap();

    engine.system_mut().set_beat(132_000);
    engine.tick();
    assert!(engine.store().session("sensor1").is_some());

    engine.system_mut().set_beat(1);
    engine.tick();
    assert!(engine.store().session("sensor1").is_none());
}

#[test]
fn test_sweep_expires_zero_address_session_once() {
    let mut engine = new_engine();
    let zero = DeviceAddress::default();
    engine.add_client("zero", 30, true, &zero).unwrap();
    engine.await_message(&zero, MessageType::WillTopic).unwrap();
    engine.add_will_topic(&zero, "sensors/zero", 0, false).unwrap();
    engine.add_will_msg(&zero, b"bye").unwrap();
    engine.add_client("sensor1", 60, true, &client_address(1)).unwrap();

    engine.system_mut().set_beat(50_000);
    engine.tick();
    assert!(engine.store().session("zero").is_none());
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 50_000);
    assert_eq!(
        engine.broker().publishes,
        vec![("sensors/zero".to_string(), b"bye".to_vec(), 0, false)]
    );

    engine.system_mut().set_beat(1_000);
    engine.tick();
    assert_eq!(engine.broker().publishes.len(), 1);
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 51_000);
}

#[test]
fn test_sweep_skips_session_deleted_after_snapshot() {
    let mut engine = new_engine();
    engine.add_client("sensor1", 60, true, &client_address(1)).unwrap();
    engine.add_client("sensor2", 60, true, &client_address(2)).unwrap();
    let snapshot: Vec<DeviceAddress> = engine.store().sessions().map(|s| s.address).collect();

    let mut tx = engine.store_mut().begin_by_client_id("sensor2");
    tx.delete_client();
    tx.commit().unwrap();

    let visited: Vec<bool> = snapshot
        .iter()
        .map(|address| engine.sweep_session(address, Some(1_000)))
        .collect();
    assert_eq!(visited, vec![true, false]);
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 1_000);
    assert!(engine.store().session("sensor2").is_none());
    assert!(engine.transport_mut().take_sent().is_empty());
}

#[test]
fn test_inbound_traffic_refreshes_keepalive() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 30, true, &address).unwrap();

    engine.system_mut().set_beat(40_000);
    engine.tick();
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 40_000);

    engine.refresh_keepalive(&address);
    assert_eq!(engine.store().session("sensor1").unwrap().timeout, 0);

    engine.system_mut().set_beat(40_000);
    engine.tick();
    assert!(engine.store().session("sensor1").is_some());
}

#[test]
fn test_empty_will_topic_clears_will() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    engine.await_message(&address, MessageType::WillTopic).unwrap();
    engine.add_will_topic(&address, "a/b", 0, false).unwrap();
    engine.add_will_msg(&address, b"bye").unwrap();
    assert_eq!(
        engine.store().session("sensor1").unwrap().will,
        Some(Will {
            topic: "a/b".to_string(),
            message: b"bye".to_vec(),
            qos: 0,
            retain: false,
        })
    );

    engine.await_message(&address, MessageType::WillTopic).unwrap();
    engine.add_will_topic(&address, "", 0, false).unwrap();
    let session = engine.store().session("sensor1").unwrap();
    assert_eq!(session.will, None);
    assert_eq!(session.awaited_message_type, MessageType::PingReq);

    // out of sequence
    assert_eq!(engine.add_will_msg(&address, b"late"), Err(CoreError::Zero));
}

#[test]
fn test_sleeping_client_gets_messages_when_awake() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    let topic_id = engine.register_topic(&address, "room/temp").unwrap();
    engine
        .add_subscription(&address, topic_id, TopicIdType::Normal, QosLevel::AtMostOnce)
        .unwrap();

    engine.set_asleep(&address, 300).unwrap();
    let session = engine.store().session("sensor1").unwrap();
    assert_eq!(session.status, ClientStatus::Asleep);
    assert_eq!(session.duration, 300_000);

    engine.receive_broker_publish("room/temp", b"1", false);
    engine.tick();
    assert!(engine.transport_mut().take_sent().is_empty());

    assert_eq!(
        engine.set_awake(&address, "someone-else"),
        Err(CoreError::ClientNonexistence)
    );
    engine.set_awake(&address, "sensor1").unwrap();
    engine.tick();

    let sent = engine.transport_mut().take_sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[0].1, Message::Publish { .. }));
    assert_eq!(sent[1].1, Message::PingResp);
    assert_eq!(
        engine.store().session("sensor1").unwrap().status,
        ClientStatus::Asleep
    );
}

#[test]
fn test_disconnected_client_receives_nothing() {
    let mut engine = new_engine();
    let address = client_address(1);
    engine.add_client("sensor1", 60, true, &address).unwrap();
    subscribe(&mut engine, 1, "room/temp");

    engine.set_disconnected(&address).unwrap();
    engine.receive_broker_publish("room/temp", b"1", false);
    engine.tick();

    assert!(engine.transport_mut().take_sent().is_empty());
    assert!(engine.store().session("sensor1").unwrap().publishes.is_empty());
    assert_eq!(
        engine.set_disconnected(&client_address(2)),
        Err(CoreError::ClientNonexistence)
    );
}
