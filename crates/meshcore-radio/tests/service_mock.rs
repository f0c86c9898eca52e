use std::time::{Duration, Instant};

use meshcore_codec::{decode, DomainEvent};
use meshcore_radio::{
    BridgeEvent, BridgeSettings, ConnectionEvent, MeshcoreService, MockHandle, MockSession,
    MockSettings, QueuedEvent, ServiceError, ServiceSettings, TransportError, ROSTER,
};
use meshcore_store::{channels, threads, Store, StoreError};
use meshcore_types::{DeliveryStatus, Destination, ThreadTarget};

fn service() -> (MeshcoreService, MockHandle) {
    let mock = MockSession::new(MockSettings {
        node_name: "Base".into(),
        interval: Duration::from_secs(600),
        ack_delay: Duration::from_millis(20),
        initial_burst: false,
    });
    let handle = mock.handle();
    let settings = ServiceSettings {
        node_name: "Base".into(),
        disconnect_settle: Duration::from_millis(500),
        bridge: BridgeSettings {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            ..BridgeSettings::default()
        },
        ..ServiceSettings::default()
    };
    let store = Store::in_memory().expect("store");
    (MeshcoreService::new(Box::new(mock), store, settings), handle)
}

/// Polls until `done` matches one of the collected events.
fn collect_until(
    service: &MeshcoreService,
    done: impl Fn(&BridgeEvent) -> bool,
) -> Vec<QueuedEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        seen.extend(service.poll_events());
        if seen.iter().any(|q| done(&q.event)) {
            return seen;
        }
        assert!(Instant::now() < deadline, "timed out; saw {seen:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn decoded(event: &BridgeEvent) -> Option<DomainEvent> {
    match event {
        BridgeEvent::Packet(raw) => decode(raw).ok().map(|d| d.event),
        _ => None,
    }
}

#[test]
fn direct_send_is_pending_then_acked_over_the_air() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");

    let alice = ROSTER.iter().find(|e| e.name == "Alice").expect("alice");
    let message = service
        .send(&Destination::Key(alice.key()), "hello")
        .expect("send");
    assert_eq!(message.delivery_status, DeliveryStatus::Pending);
    let code = message.ack_code.expect("direct sends carry an ack code");

    let events = collect_until(&service, |e| {
        matches!(decoded(e), Some(DomainEvent::Ack(ack)) if ack.code == code)
    });
    assert_eq!(events[0].event, BridgeEvent::Connection(ConnectionEvent::Connected));
    assert!(events
        .iter()
        .any(|q| q.event == BridgeEvent::MessageSent(message.clone())));

    let thread = service
        .store()
        .read(|conn| threads::get_thread(conn, message.thread_id))
        .expect("thread");
    assert_eq!(thread.target, ThreadTarget::Direct(alice.key().to_hex()));
}

#[test]
fn channel_send_is_echoed_with_the_same_hash() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");

    let message = service
        .send(&Destination::parse("#public").expect("destination"), "hi all")
        .expect("send");
    assert_eq!(message.ack_code, None);

    let events = collect_until(&service, |e| matches!(decoded(e), Some(DomainEvent::GroupText(_))));
    let echo = events
        .iter()
        .find_map(|q| match &q.event {
            BridgeEvent::Packet(raw) => decode(raw).ok(),
            _ => None,
        })
        .expect("echo");
    assert_eq!(echo.packet_hash, message.message_id);
    assert_eq!(echo.hops.len(), 1);
}

#[test]
fn refused_send_records_nothing() {
    let (mut service, _handle) = service();
    let bob = ROSTER.iter().find(|e| e.name == "Bob").expect("bob");

    let err = service
        .send(&Destination::Key(bob.key()), "anyone there?")
        .expect_err("not connected");
    assert!(matches!(err, ServiceError::Transport(TransportError::NotConnected)));

    let direct = service
        .store()
        .read(threads::list_threads)
        .expect("threads")
        .into_iter()
        .filter(|t| matches!(t.target, ThreadTarget::Direct(_)))
        .count();
    assert_eq!(direct, 0);
}

#[test]
fn send_validates_text_and_destination() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");
    let to = Destination::parse("#public").expect("destination");

    assert!(matches!(service.send(&to, "   "), Err(ServiceError::EmptyMessage)));
    assert!(matches!(
        service.send(&to, &"x".repeat(161)),
        Err(ServiceError::MessageTooLong { len: 161, max: 160 })
    ));
    assert!(matches!(
        service.send(&Destination::parse("#nowhere").expect("destination"), "hi"),
        Err(ServiceError::UnknownDestination(_))
    ));
    assert!(matches!(
        service.send(&Destination::parse("@Nobody").expect("destination"), "hi"),
        Err(ServiceError::UnknownDestination(_))
    ));
}

#[test]
fn refused_first_connect_recovers_in_background() {
    let (mut service, handle) = service();
    handle.fail_next_connects(2);

    assert!(service.connect().is_err());
    assert!(service.status().reconnecting);

    let events = collect_until(&service, |e| {
        matches!(e, BridgeEvent::Connection(ConnectionEvent::Restored { .. }))
    });
    assert!(matches!(
        events[0].event,
        BridgeEvent::Connection(ConnectionEvent::Lost { .. })
    ));
    assert!(handle.is_connected());
    assert!(service.status().connected);
}

#[test]
fn link_loss_mid_session_is_restored() {
    let (mut service, handle) = service();
    service.connect().expect("connect");
    handle.simulate_link_loss("antenna unplugged");

    let events = collect_until(&service, |e| {
        matches!(e, BridgeEvent::Connection(ConnectionEvent::Restored { .. }))
    });
    let kinds: Vec<&BridgeEvent> = events.iter().map(|q| &q.event).collect();
    assert_eq!(
        kinds[..2],
        [
            &BridgeEvent::Connection(ConnectionEvent::Connected),
            &BridgeEvent::Connection(ConnectionEvent::Lost {
                reason: "antenna unplugged".into()
            }),
        ]
    );
}

#[test]
fn disconnect_reports_and_stops() {
    let (mut service, handle) = service();
    service.connect().expect("connect");
    service.disconnect().expect("disconnect");

    let status = service.status();
    assert!(!status.connected);
    assert!(!status.reconnecting);
    assert_eq!(status.adapter.as_str(), "mock");
    assert!(!handle.is_connected());

    let events = service.poll_events();
    assert_eq!(
        events.last().map(|q| &q.event),
        Some(&BridgeEvent::Connection(ConnectionEvent::Disconnected))
    );
}

#[test]
fn failed_transmit_on_a_live_link_triggers_reconnect() {
    let (mut service, handle) = service();
    service.connect().expect("connect");
    handle.fail_next_transmits(1);

    let to = Destination::parse("#public").expect("destination");
    let err = service.send(&to, "lost in the ether").expect_err("transmit fails");
    assert!(matches!(err, ServiceError::Transport(TransportError::Simulated(_))));

    let events = collect_until(&service, |e| {
        matches!(e, BridgeEvent::Connection(ConnectionEvent::Restored { .. }))
    });
    let links: Vec<&ConnectionEvent> = events
        .iter()
        .filter_map(|q| match &q.event {
            BridgeEvent::Connection(c) => Some(c),
            _ => None,
        })
        .collect();
    assert!(matches!(links[..], [
        ConnectionEvent::Connected,
        ConnectionEvent::Lost { .. },
        ConnectionEvent::Restored { .. },
    ]), "{links:?}");
    assert!(!events.iter().any(|q| matches!(q.event, BridgeEvent::MessageSent(_))));

    let message = service.send(&to, "second try").expect("send after restore");
    assert_eq!(message.delivery_status, DeliveryStatus::Pending);
}

#[test]
fn telemetry_request_is_answered_over_the_air() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");

    let bob = ROSTER.iter().find(|e| e.name == "Bob").expect("bob");
    let to = Destination::Key(bob.key());
    let first = service.request_telemetry(&to).expect("request");
    let second = service.request_telemetry(&to).expect("request");
    assert!(second > first, "each request gets a fresh tag");

    let events = collect_until(&service, |e| {
        matches!(decoded(e), Some(DomainEvent::Response(r)) if r.tag == second)
    });
    let response = events
        .iter()
        .find_map(|q| match decoded(&q.event) {
            Some(DomainEvent::Response(r)) if r.tag == second => Some(r),
            _ => None,
        })
        .expect("response");
    assert_eq!(response.dest, service.self_key().short_id());
    assert!(!response.data.is_empty());
}

#[test]
fn channels_cannot_be_asked_for_telemetry() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");
    let err = service
        .request_telemetry(&Destination::parse("#public").expect("destination"))
        .expect_err("channel");
    assert!(matches!(err, ServiceError::Unroutable(_)));
}

#[test]
fn favorites_and_channel_removal() {
    let (mut service, _handle) = service();
    service.connect().expect("connect");

    let alice = ROSTER.iter().find(|e| e.name == "Alice").expect("alice");
    service
        .send(&Destination::Key(alice.key()), "hi")
        .expect("send creates the peer");
    let pinned = service
        .set_favorite(&alice.key().to_hex(), true)
        .expect("pin");
    assert!(pinned.is_favorite);
    assert!(matches!(
        service.set_favorite("no-such-peer", true),
        Err(ServiceError::Store(StoreError::NotFound(_)))
    ));

    let ops = service
        .import_channel("ops", "00112233445566778899aabbccddeeff")
        .expect("import");
    service
        .send(&Destination::parse("#ops").expect("destination"), "status?")
        .expect("send");
    assert_eq!(service.remove_channel(&ops.channel_id).expect("remove"), 1);
    assert!(service
        .store()
        .read(|conn| channels::find_channel_by_name(conn, "ops"))
        .expect("query")
        .is_none());
    assert!(matches!(
        service.remove_channel("public"),
        Err(ServiceError::Store(StoreError::InvalidInput(_)))
    ));
}
