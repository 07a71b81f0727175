mod common;

use std::time::Duration;

use serde_json::json;

use bauklank_net::protocol::HubMessage;
use bauklank_net::server::{ClientEvent, DEFAULT_QUEUE_CAPACITY};

use common::{bind_local, drive_until_clients, drive_until_event, set_msg, slot, RawClient};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn greeting_precedes_broadcasts() {
    let (mut server, addr) = bind_local(DEFAULT_QUEUE_CAPACITY);

    let stream = RawClient::open(&addr).unwrap();
    drive_until_clients(&mut server, 1, TIMEOUT);
    let id = server.client_ids()[0];

    let version = HubMessage::ServerVersion {
        version: "2.15.1".into(),
    };
    assert!(server.send_to(id, &version));
    server.broadcast(&set_msg("A", "rate", json!(0.5)));

    let mut client = RawClient::handshake(&addr, stream);
    assert_eq!(client.recv(), version);
    assert_eq!(client.recv(), set_msg("A", "rate", json!(0.5)));
}

#[test]
fn every_client_receives_every_message_in_order() {
    let (mut server, addr) = bind_local(DEFAULT_QUEUE_CAPACITY);

    let s1 = RawClient::open(&addr).unwrap();
    let s2 = RawClient::open(&addr).unwrap();
    drive_until_clients(&mut server, 2, TIMEOUT);
    let mut c1 = RawClient::handshake(&addr, s1);
    let mut c2 = RawClient::handshake(&addr, s2);

    let sent: Vec<HubMessage> = (0..20)
        .map(|i| set_msg(if i % 2 == 0 { "A" } else { "B" }, "volume", json!(i)))
        .collect();
    for msg in &sent {
        assert_eq!(server.broadcast(msg), 2);
    }

    for client in [&mut c1, &mut c2] {
        let received: Vec<HubMessage> = (0..sent.len()).map(|_| client.recv()).collect();
        assert_eq!(received, sent);
    }
}

#[test]
fn hello_records_engine_slots() {
    let (mut server, addr) = bind_local(DEFAULT_QUEUE_CAPACITY);

    let stream = RawClient::open(&addr).unwrap();
    drive_until_clients(&mut server, 1, TIMEOUT);
    let mut client = RawClient::handshake(&addr, stream);

    // Malformed frames are dropped without closing the session.
    client.send_text("not json");
    client.send_text(r#"{"type":"subscribe"}"#);
    client.send_hello(&["A", "c"]);

    let event = drive_until_event(&mut server, TIMEOUT, |e| {
        matches!(e, ClientEvent::Hello { .. })
    });
    let id = server.client_ids()[0];
    assert_eq!(
        event,
        ClientEvent::Hello {
            client_id: id,
            engine_slots: vec![slot("A"), slot("C")],
        }
    );
    assert_eq!(server.engine_slots(id), Some(&[slot("A"), slot("C")][..]));
    assert_eq!(server.client_count(), 1);
}

#[test]
fn closed_client_is_removed() {
    let (mut server, addr) = bind_local(DEFAULT_QUEUE_CAPACITY);

    let stream = RawClient::open(&addr).unwrap();
    drive_until_clients(&mut server, 1, TIMEOUT);
    let client = RawClient::handshake(&addr, stream);
    drop(client);

    drive_until_event(&mut server, TIMEOUT, |e| {
        matches!(e, ClientEvent::Closed { .. })
    });
    assert_eq!(server.client_count(), 0);
    assert_eq!(server.broadcast(&set_msg("A", "rate", json!(1.0))), 0);
}
