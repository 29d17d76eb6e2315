use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fleetbook::config::EngineConfig;
use fleetbook::engine::{now_ms, Engine};
use fleetbook::notify::NotifyHub;
use fleetbook::wire;

const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fleetbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("fleetbook.wal"), Arc::new(NotifyHub::new()), EngineConfig::default())
            .unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ =
                    wire::process_connection(socket, engine, "fleetbook".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fleet")
        .user("fleetbook")
        .password("fleetbook");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Inserts one resource and one requester; returns their ids.
async fn seed(client: &tokio_postgres::Client) -> (Ulid, Ulid) {
    let rid = Ulid::new();
    let who = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, category, seats) VALUES ('{rid}', 'van', 8); \
             INSERT INTO requesters (id, name) VALUES ('{who}', 'Ada')"
        ))
        .await
        .unwrap();
    (rid, who)
}

fn book_sql(id: Ulid, who: Ulid, rid: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO reservations (id, requester_id, resource_id, start, "end") VALUES ('{id}', '{who}', '{rid}', {start}, {end})"#
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let (rid, who) = seed(&client).await;
    let t = now_ms() + 24 * H;

    let sql = format!(
        r#"SELECT * FROM availability WHERE resource_id = '{rid}' AND start >= {t} AND "end" <= {}"#,
        t + H
    );
    let avail = rows(&client, &sql).await;
    assert_eq!(avail.len(), 1);
    assert_eq!(avail[0].get("available"), Some("t"));

    let id = Ulid::new();
    client.batch_execute(&book_sql(id, who, rid, t, t + H)).await.unwrap();

    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("status"), Some("ACTIVE"));
    assert_eq!(found[0].get("resource_id"), Some(rid.to_string().as_str()));

    let resources = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(resources[0].get("status"), Some("RESERVED"));

    client
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'CANCELLED' WHERE id = '{id}' AND requester_id = '{who}'"
        ))
        .await
        .unwrap();
    let resources = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(resources[0].get("status"), Some("AVAILABLE"));
}

fn resource_sql(id: Ulid) -> String {
    format!("INSERT INTO resources (id, category, seats) VALUES ('{id}', 'van', 8)")
}

#[tokio::test]
async fn batch_runs_every_statement() {
    let (addr, engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let (a, b) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!("{}; {};", resource_sql(a), resource_sql(b)))
        .await
        .unwrap();
    assert!(engine.get_resource(&a).await.is_some());
    assert!(engine.get_resource(&b).await.is_some());

    // A failing statement ends the batch; earlier ones stay committed.
    let (c, d) = (Ulid::new(), Ulid::new());
    let err = client
        .batch_execute(&format!("{}; {}; {}", resource_sql(c), resource_sql(a), resource_sql(d)))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));
    assert!(engine.get_resource(&c).await.is_some());
    assert!(engine.get_resource(&d).await.is_none());

    // A statement that does not parse rejects the whole batch up front.
    let e = Ulid::new();
    let err = client
        .batch_execute(&format!("{}; DROP TABLE resources", resource_sql(e)))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
    assert!(engine.get_resource(&e).await.is_none());
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let (rid, who) = seed(&client).await;
    let t = now_ms() + 24 * H;

    client.batch_execute(&book_sql(Ulid::new(), who, rid, t, t + 2 * H)).await.unwrap();

    let err = client
        .batch_execute(&book_sql(Ulid::new(), who, rid, t + H, t + 3 * H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, requester_id, resource_id, start, "end") VALUES ('{}', '{who}', '{rid}', NULL, {t})"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .batch_execute(&book_sql(Ulid::new(), who, Ulid::new(), t, t + H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    client
        .batch_execute(&format!("UPDATE resources SET status = 'MAINTENANCE' WHERE id = '{rid}'"))
        .await
        .unwrap();
    let err = client
        .batch_execute(&book_sql(Ulid::new(), who, rid, t + 5 * H, t + 6 * H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let err = client.batch_execute("DROP TABLE resources").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let (rid, who) = seed(&client).await;
    let t = now_ms() + 24 * H;

    let id = Ulid::new();
    let params = [
        id.to_string(),
        who.to_string(),
        rid.to_string(),
        t.to_string(),
        (t + H).to_string(),
    ];
    client
        .execute(
            r#"INSERT INTO reservations (id, requester_id, resource_id, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[&params[0], &params[1], &params[2], &params[3], &params[4]],
        )
        .await
        .unwrap();

    let r = engine.get_reservation(id).await.unwrap();
    assert_eq!((r.span.start, r.span.end), (t, t + H));
}

#[tokio::test]
async fn listen_delivers_on_next_statement() {
    let (addr, _engine) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let (rid, who) = seed(&client1).await;
    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();

    let (client2, _rx2) = connect(addr).await;
    let t = now_ms() + 24 * H;
    client2.batch_execute(&book_sql(Ulid::new(), who, rid, t, t + H)).await.unwrap();

    // Pending events go out ahead of the listener's next statement.
    client1.batch_execute("SELECT * FROM resources").await.unwrap();
    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("resource_{rid}"));
    assert!(notif.payload().contains("reservation_committed"));

    client1.batch_execute("UNLISTEN *").await.unwrap();
    client2
        .batch_execute(&format!("UPDATE resources SET status = 'RENTED' WHERE id = '{rid}'"))
        .await
        .unwrap();
    client1.batch_execute("SELECT * FROM resources").await.unwrap();
    assert!(recv_notification(&mut rx1, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_bad_channel() {
    let (addr, _engine) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let err = client.batch_execute("LISTEN cars").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42602"));
}
