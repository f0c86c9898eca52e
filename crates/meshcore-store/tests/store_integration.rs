use chrono::{Duration, Utc};
use meshcore_db::DbRuntimeSettings;
use meshcore_store::messages::{self, NewMessage};
use meshcore_store::{channels, peers, threads, Evidence, NodeResolver, SenderIdentifier, Store};
use meshcore_types::{DeliveryStatus, Direction, NodeType, PublicKey, ShortId};

fn open_store(dir: &tempfile::TempDir, busy_timeout_ms: u64) -> Store {
    let path = dir.path().join("meshcore.db");
    Store::open(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms,
            ..DbRuntimeSettings::default()
        },
    )
    .expect("failed to open store")
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key = PublicKey::from_bytes([0x5a; 32]);
    let stable_id = {
        let store = open_store(&dir, 500);
        store
            .transaction(|conn| {
                channels::import_channel(conn, "Ops", "00112233445566778899aabbccddeeff", Utc::now())?;
                let res = NodeResolver::new(conn).resolve(
                    &SenderIdentifier::PublicKey(key),
                    &Evidence {
                        public_key: Some(key),
                        display_name: Some("Alice".into()),
                        node_type: Some(NodeType::Chat),
                        ..Evidence::seen(Utc::now())
                    },
                )?;
                Ok(res.peer.stable_id)
            })
            .expect("seed")
    };

    let store = open_store(&dir, 500);
    let peer = store
        .read(|conn| peers::get_peer(conn, &stable_id))
        .expect("peer after reopen");
    assert_eq!(peer.public_key, Some(key));
    assert_eq!(peer.display_name, "Alice");

    let names: Vec<String> = store
        .read(channels::list_channels)
        .expect("channels")
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert!(names.contains(&"public".to_string()));
    assert!(names.contains(&"ops".to_string()));
}

#[test]
fn write_contention_is_transient_and_rolls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, 50);

    let blocker = rusqlite::Connection::open(dir.path().join("meshcore.db")).expect("open blocker");
    blocker.execute_batch("BEGIN IMMEDIATE;").expect("take write lock");

    let err = store
        .transaction(|conn| {
            channels::import_channel(conn, "late", "ffeeddccbbaa99887766554433221100", Utc::now())
        })
        .expect_err("write lock is held");
    assert!(err.is_transient(), "unexpected error: {err}");

    blocker.execute_batch("ROLLBACK;").expect("release write lock");
    store
        .transaction(|conn| {
            channels::import_channel(conn, "late", "ffeeddccbbaa99887766554433221100", Utc::now())
        })
        .expect("write after release");
}

#[test]
fn promoted_peer_keeps_its_conversation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir, 500);
    let then = Utc::now() - Duration::minutes(5);

    let prov_id = store
        .transaction(|conn| {
            let res = NodeResolver::new(conn)
                .resolve(&SenderIdentifier::ShortId(ShortId(0xc4)), &Evidence::seen(then))?;
            let thread = threads::ensure_direct_thread(conn, &res.peer.stable_id, then)?;
            messages::insert_message(
                conn,
                &NewMessage {
                    message_id: "early".into(),
                    thread_id: thread.id,
                    direction: Direction::Inbound,
                    sender_peer_id: Some(res.peer.stable_id.clone()),
                    sender_name: None,
                    body: "hello before the advert".into(),
                    delivery_status: DeliveryStatus::Received,
                    ack_code: None,
                    path_hops: Vec::new(),
                    snr: None,
                    rssi: None,
                    created_at: then,
                },
            )?;
            Ok(res.peer.stable_id)
        })
        .expect("provisional sender");

    let mut bytes = [0x11; 32];
    bytes[0] = 0xc4;
    let key = PublicKey::from_bytes(bytes);
    let res = store
        .transaction(|conn| {
            NodeResolver::new(conn).resolve(
                &SenderIdentifier::PublicKey(key),
                &Evidence {
                    public_key: Some(key),
                    display_name: Some("Charlie".into()),
                    ..Evidence::seen(Utc::now())
                },
            )
        })
        .expect("advert");
    assert!(res.promoted);
    assert_eq!(res.peer.stable_id, prov_id);

    let message = store
        .read(|conn| messages::get_message(conn, "early"))
        .expect("message");
    assert_eq!(message.sender_peer_id.as_deref(), Some(prov_id.as_str()));
    assert_eq!(peers::list_peers(&store.pool().get().expect("conn"), true).expect("list").len(), 1);
}
