use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotkeeper::engine::Engine;
use slotkeeper::store::MemoryStore;
use slotkeeper::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = MemoryStore::new();
    let engine = Arc::new(Engine::new(
        Arc::new(store.clone()),
        FixedOffset::east_opt(0).unwrap(),
        Duration::from_secs(5),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let catalog = Arc::new(store.clone());
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, catalog, "slotkeeper".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("schedule")
        .user("slotkeeper")
        .password("slotkeeper");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.expect_err("statement should fail");
    err.code().expect("server error with SQLSTATE").code().to_string()
}

/// Bookable resource with one Monday window 09:00-12:00.
async fn setup_resource(client: &Client, capacity: u32) -> (Ulid, Ulid) {
    let rid = Ulid::new();
    let wid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, is_bookable) VALUES ('{rid}', 'Court 1', true)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO windows (id, resource_id, day_of_week, start_time, end_time, capacity) \
             VALUES ('{wid}', '{rid}', 1, '09:00', '12:00', {capacity})"
        ))
        .await
        .unwrap();
    (rid, wid)
}

fn reserve_sql(rid: Ulid, customer: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO reservations (resource_id, customer_id, start_datetime, end_datetime) \
         VALUES ('{rid}', '{customer}', '2024-01-01T{start}:00', '2024-01-01T{end}:00')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_then_availability_reflects_it() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (rid, _) = setup_resource(&client, 2).await;

    let availability = format!("SELECT * FROM availability WHERE resource_id = '{rid}' AND date = '2024-01-01'");
    let before = rows(&client, &availability).await;
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].get("start_time"), Some("09:00:00"));
    assert_eq!(before[0].get("end_time"), Some("12:00:00"));
    assert_eq!(before[0].get("remaining_capacity"), Some("2"));

    client
        .batch_execute(&reserve_sql(rid, "alice", "10:00", "11:00"))
        .await
        .unwrap();

    let after = rows(&client, &availability).await;
    assert_eq!(after[0].get("remaining_capacity"), Some("1"));
    assert_eq!(after[0].get("date"), Some("2024-01-01"));
}

#[tokio::test]
async fn reserve_returning_yields_the_row() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (rid, _) = setup_resource(&client, 1).await;

    let sql = format!("{} RETURNING *", reserve_sql(rid, "bob", "09:00", "09:30"));
    let returned = rows(&client, &sql).await;
    assert_eq!(returned.len(), 1);
    let row = &returned[0];
    assert!(Ulid::from_string(row.get("id").unwrap()).is_ok());
    assert_eq!(row.get("resource_id"), Some(rid.to_string().as_str()));
    assert_eq!(row.get("customer_id"), Some("bob"));
    assert_eq!(row.get("booking_date"), Some("2024-01-01"));
    assert_eq!(row.get("start_datetime"), Some("2024-01-01 09:00:00"));
    assert_eq!(row.get("end_datetime"), Some("2024-01-01 09:30:00"));
    assert_eq!(row.get("status"), Some("CONFIRMED"));

    let listed = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE resource_id = '{rid}' AND date = '2024-01-01'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), row.get("id"));
}

#[tokio::test]
async fn engine_errors_carry_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (rid, _) = setup_resource(&client, 1).await;

    // Validation: end before start.
    assert_eq!(sqlstate(&client, &reserve_sql(rid, "c", "11:00", "10:00")).await, "22023");
    // Validation: missing customer.
    let missing = format!(
        "INSERT INTO reservations (resource_id, start_datetime, end_datetime) \
         VALUES ('{rid}', '2024-01-01T09:00:00', '2024-01-01T10:00:00')"
    );
    assert_eq!(sqlstate(&client, &missing).await, "22023");
    // NotFound: unknown resource.
    assert_eq!(sqlstate(&client, &reserve_sql(Ulid::new(), "c", "09:00", "10:00")).await, "P0002");
    // OutOfRange: spills past the window end.
    assert_eq!(sqlstate(&client, &reserve_sql(rid, "c", "11:30", "12:30")).await, "22008");

    client
        .batch_execute(&reserve_sql(rid, "first", "09:00", "10:00"))
        .await
        .unwrap();
    // CapacityExceeded: overlaps the confirmed reservation.
    assert_eq!(sqlstate(&client, &reserve_sql(rid, "second", "09:30", "10:30")).await, "23P01");
    // Touching the end is fine.
    client
        .batch_execute(&reserve_sql(rid, "third", "10:00", "11:00"))
        .await
        .unwrap();

    // Parse error.
    assert_eq!(sqlstate(&client, "SELEC nonsense").await, "42601");
    // Availability without a date.
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM availability WHERE resource_id = '{rid}'")).await,
        "22023"
    );
}

#[tokio::test]
async fn non_bookable_resource_is_hidden() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (rid, _) = setup_resource(&client, 1).await;

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert!(listed.iter().any(|r| r.get("id") == Some(rid.to_string().as_str())));

    client
        .batch_execute(&format!("UPDATE resources SET is_bookable = false WHERE id = '{rid}'"))
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert!(!listed.iter().any(|r| r.get("id") == Some(rid.to_string().as_str())));
    assert_eq!(sqlstate(&client, &reserve_sql(rid, "c", "09:00", "10:00")).await, "P0002");
    assert_eq!(
        sqlstate(
            &client,
            &format!("SELECT * FROM availability WHERE resource_id = '{rid}' AND date = '2024-01-01'")
        )
        .await,
        "P0002"
    );
}

#[tokio::test]
async fn catalog_conflicts_carry_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (rid, wid) = setup_resource(&client, 1).await;

    let dup = format!("INSERT INTO resources (id) VALUES ('{rid}')");
    assert_eq!(sqlstate(&client, &dup).await, "23505");

    let overlapping = format!(
        "INSERT INTO windows (resource_id, day_of_week, start_time, end_time, capacity) \
         VALUES ('{rid}', 1, '11:00', '13:00', 1)"
    );
    assert_eq!(sqlstate(&client, &overlapping).await, "23514");

    let inverted = format!(
        "INSERT INTO windows (resource_id, day_of_week, start_time, end_time, capacity) \
         VALUES ('{rid}', 2, '13:00', '12:00', 1)"
    );
    assert_eq!(sqlstate(&client, &inverted).await, "23514");

    let windows = rows(&client, &format!("SELECT * FROM windows WHERE resource_id = '{rid}'")).await;
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].get("id"), Some(wid.to_string().as_str()));
    assert_eq!(windows[0].get("day_of_week"), Some("1"));
    assert_eq!(windows[0].get("capacity"), Some("1"));

    client
        .batch_execute(&format!("DELETE FROM windows WHERE id = '{wid}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM windows WHERE id = '{wid}'")).await,
        "P0002"
    );

    // With the window gone, nothing on Monday is reservable.
    assert_eq!(sqlstate(&client, &reserve_sql(rid, "c", "09:00", "10:00")).await, "22008");
    let open = rows(
        &client,
        &format!("SELECT * FROM availability WHERE resource_id = '{rid}' AND date = '2024-01-01'"),
    )
    .await;
    assert!(open.is_empty());
}

#[tokio::test]
async fn concurrent_clients_never_overbook() {
    let addr = start_test_server().await;
    let setup = connect(addr).await;
    let (rid, _) = setup_resource(&setup, 2).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&reserve_sql(rid, &format!("cust-{i}"), "10:00", "11:00"))
                .await
                .map_err(|e| e.code().map(|c| c.code().to_string()))
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(code) => assert_eq!(code.as_deref(), Some("23P01")),
        }
    }
    assert_eq!(ok, 2);

    let confirmed = rows(
        &setup,
        &format!("SELECT * FROM reservations WHERE resource_id = '{rid}' AND date = '2024-01-01'"),
    )
    .await;
    assert_eq!(confirmed.len(), 2);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .user("slotkeeper")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
