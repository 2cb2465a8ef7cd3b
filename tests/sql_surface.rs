use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use reservd::tenant::TenantManager;
use reservd::wire;

const PASSWORD: &str = "reservd";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("reservd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Duration::from_secs(5)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, dbname: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("reservd")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "test", PASSWORD).await.unwrap()
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

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("database error").code().to_string()
}

async fn create_resource(client: &Client, name: &str) -> String {
    let created = rows(client, &format!("INSERT INTO resources (name) VALUES ('{name}')")).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("name"), Some(name));
    created[0].get("id").unwrap().to_string()
}

fn reserve_sql(resource_id: &str, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO reservations (resource_id, start, "end") VALUES ('{resource_id}', {start}, {end})"#)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_check() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let health = rows(&client, "SELECT * FROM health").await;
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].get("status"), Some("server healthy"));
}

#[tokio::test]
async fn wrong_password_rejected() {
    let addr = start_test_server().await;
    assert!(connect_as(addr, "test", "wrong").await.is_err());
}

#[tokio::test]
async fn create_and_lookup_resources() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create_resource(&client, "room 1").await;
    create_resource(&client, "room 2").await;
    create_resource(&client, "hall").await;

    let all = rows(&client, "SELECT * FROM resources").await;
    let names: Vec<_> = all.iter().map(|r| r.get("name").unwrap()).collect();
    assert_eq!(names, ["room 1", "room 2", "hall"]);

    let one = rows(&client, &format!("SELECT * FROM resources WHERE id = '{id}'")).await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].get("name"), Some("room 1"));

    let rooms = rows(&client, "SELECT * FROM resources WHERE name LIKE 'room%'").await;
    assert_eq!(rooms.len(), 2);
}

#[tokio::test]
async fn resource_errors_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    create_resource(&client, "room 1").await;

    assert_eq!(sqlstate(&client, "INSERT INTO resources (name) VALUES ('room 1')").await, "23505");
    assert_eq!(sqlstate(&client, "INSERT INTO resources (name) VALUES (' ')").await, "22023");
    let long = "x".repeat(31);
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO resources (name) VALUES ('{long}')")).await,
        "22023"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM resources WHERE id = 'nope'").await, "22P02");
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM resources WHERE id = '{}'", Ulid::new())).await,
        "02000"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM resources WHERE name LIKE '%'").await, "42601");
}

#[tokio::test]
async fn reserve_room_and_reject_overlap() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = create_resource(&client, "room-1").await;

    let booked = rows(&client, &reserve_sql(&room, 1577293360, 1578293360)).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("resource_id"), Some(room.as_str()));
    assert_eq!(booked[0].get("start"), Some("1577293360"));
    assert_eq!(booked[0].get("end"), Some("1578293360"));
    let booked_id = booked[0].get("id").unwrap().to_string();

    // Nested inside the first one
    assert_eq!(sqlstate(&client, &reserve_sql(&room, 1577800000, 1577900000)).await, "23P01");

    // Back to back is fine
    rows(&client, &reserve_sql(&room, 1578293360, 1578300000)).await;

    let listed = rows(&client, &format!("SELECT * FROM reservations WHERE resource_id = '{room}'")).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("id"), Some(booked_id.as_str()));

    let one = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{booked_id}'")).await;
    assert_eq!(one.len(), 1);
    assert_eq!(rows(&client, "SELECT * FROM reservations").await.len(), 2);
}

#[tokio::test]
async fn reservation_errors_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = create_resource(&client, "room 1").await;

    assert_eq!(sqlstate(&client, &reserve_sql(&room, 20, 20)).await, "22007");
    assert_eq!(sqlstate(&client, &reserve_sql(&room, 30, 20)).await, "22007");
    assert_eq!(sqlstate(&client, &reserve_sql("nope", 10, 20)).await, "22P02");
    assert_eq!(
        sqlstate(&client, &reserve_sql(&Ulid::new().to_string(), 10, 20)).await,
        "02000"
    );
    assert!(rows(&client, "SELECT * FROM reservations").await.is_empty());
}

#[tokio::test]
async fn unsupported_statements() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = create_resource(&client, "room 1").await;

    assert_eq!(sqlstate(&client, &format!("DELETE FROM resources WHERE id = '{room}'")).await, "0A000");
    assert_eq!(sqlstate(&client, "UPDATE resources SET name = 'x'").await, "0A000");
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42P01");
    assert_eq!(sqlstate(&client, "RESERVE EVERYTHING").await, "42601");
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let created = client
        .query("INSERT INTO resources (name) VALUES ($1)", &[&"room 7"])
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let id: String = created[0].get("id");

    let found = client
        .query("SELECT * FROM resources WHERE id = $1", &[&id.as_str()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get::<_, String>("name"), "room 7");

    let booked = client
        .query(
            r#"INSERT INTO reservations (resource_id, start, "end") VALUES ($1, $2, $3)"#,
            &[&id.as_str(), &"100", &"200"],
        )
        .await
        .unwrap();
    assert_eq!(booked[0].get::<_, i64>("start"), 100);
    assert_eq!(booked[0].get::<_, i64>("end"), 200);
}

#[tokio::test]
async fn databases_are_isolated_tenants() {
    let addr = start_test_server().await;
    let hotel = connect_as(addr, "hotel", PASSWORD).await.unwrap();
    let library = connect_as(addr, "library", PASSWORD).await.unwrap();

    create_resource(&hotel, "room 1").await;
    create_resource(&library, "room 1").await;

    assert_eq!(rows(&hotel, "SELECT * FROM resources").await.len(), 1);
    assert_eq!(rows(&library, "SELECT * FROM resources").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_one_winner() {
    let addr = start_test_server().await;
    let setup = connect(addr).await;
    let room = create_resource(&setup, "room 1").await;

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let room = room.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            // All requests cover [1000, 1001)
            client.simple_query(&reserve_sql(&room, 1000 - i, 1001 + i)).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.code().map(|c| c.code()), Some("23P01")),
        }
    }
    assert_eq!(ok, 1);
    let listed = rows(&setup, &format!("SELECT * FROM reservations WHERE resource_id = '{room}'")).await;
    assert_eq!(listed.len(), 1);
}
