use meshcore_db::{create_pool, run_migrations, run_migrations_up_to, DbRuntimeSettings};

#[test]
fn db_initialization_works() {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 4);

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(
        tables,
        vec![
            "_meshcore_migrations",
            "channels",
            "messages",
            "packets",
            "peers",
            "threads"
        ]
    );
}

#[test]
fn later_migrations_preserve_peer_ids_and_message_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("upgrade.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");

    run_migrations_up_to(&conn, "000_init").expect("stage initial schema");
    conn.execute_batch(
        "INSERT INTO peers (stable_id, display_name, first_seen_at, last_seen_at)
             VALUES ('peer-a', 'Alice', 't0', 't0');
         INSERT INTO threads (peer_id, created_at) VALUES ('peer-a', 't0');
         INSERT INTO messages (message_id, thread_id, direction, sender_peer_id, body,
                               delivery_status, created_at, status_updated_at)
             VALUES ('m1', 1, 'inbound', 'peer-a', 'first', 'received', 't1', 't1'),
                    ('m2', 1, 'inbound', 'peer-a', 'second', 'received', 't2', 't2');",
    )
    .expect("seed rows");

    let applied = run_migrations(&conn).expect("upgrade");
    assert_eq!(applied, 3);

    let (stable_id, favorite): (String, bool) = conn
        .query_row(
            "SELECT stable_id, is_favorite FROM peers WHERE display_name = 'Alice'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("peer survives");
    assert_eq!(stable_id, "peer-a");
    assert!(!favorite, "upgraded peers start unpinned");

    let mut stmt = conn
        .prepare("SELECT message_id FROM messages WHERE thread_id = 1 ORDER BY seq")
        .expect("prepare");
    let order: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("query")
        .map(|r| r.expect("row"))
        .collect();
    assert_eq!(order, vec!["m1", "m2"]);
}
