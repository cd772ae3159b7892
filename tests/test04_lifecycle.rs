mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sql_scheduler::prelude::*;
use tokio::sync::broadcast;
use tokio::time::timeout;

use common::{Recorder, RecordingEngine, Scratch};

const ENDLESS: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

async fn memory() -> Result<Connection, SqlSchedulerError> {
    ConnectionOptionsBuilder::new(":memory:").build().await
}

async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Result<Event, Box<dyn Error>> {
    Ok(timeout(Duration::from_secs(5), rx.recv()).await??)
}

#[tokio::test]
async fn closed_connection_rejects_everything() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    assert_eq!(conn.state(), ConnectionState::Open);
    conn.close().await?;
    assert_eq!(conn.state(), ConnectionState::Closed);

    let err = conn.exec("SELECT 1").await.expect_err("closed");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Database is closed");
    let err = conn.prepare("SELECT 1").await.expect_err("closed");
    assert!(err.is_misuse());
    let err = conn.close().await.expect_err("second close");
    assert!(err.is_misuse());
    let err = conn.interrupt().expect_err("not open");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Database is not open");
    Ok(())
}

#[tokio::test]
async fn closed_connection_never_reaches_the_engine() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let recorder = Recorder::default();
    let conn = ConnectionOptionsBuilder::new(scratch.db("closed.db"))
        .build_with(RecordingEngine::new(recorder.clone(), Duration::ZERO))
        .await?;
    conn.exec("CREATE TABLE t (v INTEGER)").await?;
    let leftover = conn.prepare("INSERT INTO t VALUES (1)").await?;
    leftover.finalize().await?;
    let finished = conn.backup(scratch.db("copy.db"));
    assert!(finished.step(-1).await?);
    conn.close().await?;
    let calls = recorder.spans().len();

    assert!(conn.exec("SELECT 1").await.is_err());
    assert!(conn.prepare("SELECT 1").await.is_err());
    assert!(conn.run("INSERT INTO t VALUES (2)", ()).await.is_err());
    assert!(conn.map("SELECT v, v FROM t", ()).await.is_err());
    assert!(leftover.run(()).await.is_err());
    assert!(finished.step(1).await.is_err());
    let late = conn.backup(scratch.db("late.db"));
    assert!(late.step(1).await.is_err());
    assert!(late.is_failed());
    assert!(conn.configure_busy_timeout(Duration::from_millis(1)).await.is_err());
    assert!(conn.configure_limit(Limit::Length, 10).await.is_err());
    assert!(conn.wait().await.is_err());
    assert!(conn.close().await.is_err());

    assert_eq!(recorder.spans().len(), calls, "{:?}", recorder.spans());
    Ok(())
}

#[tokio::test]
async fn lost_connection_keeps_live_handles_off_the_engine() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let recorder = Recorder::default();
    let conn = ConnectionOptionsBuilder::new(scratch.db("lost.db"))
        .build_with(RecordingEngine::new(recorder.clone(), Duration::ZERO))
        .await?;
    conn.exec("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2), (3);")
        .await?;
    let stmt = conn.prepare("SELECT v FROM t").await?;
    let backup = conn.backup(scratch.db("copy.db"));
    assert!(!backup.step(1).await?);

    recorder.break_engine();
    assert!(conn.exec("SELECT 1").await.is_err());
    assert_eq!(conn.state(), ConnectionState::Closed);
    let calls = recorder.spans().len();

    let err = stmt.run(()).await.expect_err("connection lost");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Database is closed");
    assert!(stmt.get(()).await.is_err());
    assert!(stmt.reset().await.is_err());
    let err = backup.step(-1).await.expect_err("connection lost");
    assert!(err.is_misuse());

    assert_eq!(recorder.spans().len(), calls, "{:?}", recorder.spans());
    Ok(())
}

#[tokio::test]
async fn configured_limits_apply_to_later_statements() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    conn.exec("CREATE TABLE t (txt TEXT)").await?;

    let default_length = conn.configure_limit(Limit::Length, 16).await?;
    assert!(default_length > 16);
    assert_eq!(conn.configure_limit(Limit::Length, 16).await?, 16);

    conn.run("INSERT INTO t VALUES (?)", vec![RowValues::Text("short".into())])
        .await?;
    let err = conn
        .run("INSERT INTO t VALUES (?)", vec![RowValues::Text("x".repeat(64))])
        .await
        .expect_err("value exceeds the length limit");
    assert_eq!(err.code(), Some(ErrorCode::TooBig));

    conn.configure_limit(Limit::Length, default_length).await?;
    conn.run("INSERT INTO t VALUES (?)", vec![RowValues::Text("x".repeat(64))])
        .await?;

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn submissions_fail_while_closing() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    conn.exec("CREATE TABLE t (v INTEGER)").await?;

    let before = conn.run("INSERT INTO t VALUES (1)", ());
    let closing = conn.close();
    assert_eq!(conn.state(), ConnectionState::Closing);

    let err = conn.exec("SELECT 1").await.expect_err("closing");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Database is closing");
    let err = conn.interrupt().expect_err("closing");
    assert!(err.is_misuse());

    // Work queued ahead of the close still runs.
    assert_eq!(before.await?.changes, 1);
    closing.await?;
    assert_eq!(conn.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test]
async fn close_refused_while_statements_are_live() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    let stmt = conn.prepare("SELECT 1 AS one").await?;

    let err = conn.close().await.expect_err("statement still prepared");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    assert_eq!(conn.state(), ConnectionState::Open);

    // The connection keeps working after a refused close.
    let row = stmt.get(()).await?.ok_or("row")?;
    assert_eq!(row.get("one"), Some(&RowValues::Int(1)));

    stmt.finalize().await?;
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_aborts_the_running_call_only() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    let endless = conn.get(ENDLESS, ());
    let after = conn.get("SELECT 2 AS two", ());

    let stop = Arc::new(AtomicBool::new(false));
    let interrupter = {
        let conn = conn.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if stop.load(Ordering::SeqCst) || conn.interrupt().is_err() {
                    break;
                }
            }
        })
    };

    let err = timeout(Duration::from_secs(10), endless)
        .await?
        .expect_err("query was interrupted");
    stop.store(true, Ordering::SeqCst);
    interrupter.await?;
    assert!(err.is_interrupted(), "{err}");
    assert!(matches!(err, SqlSchedulerError::Interrupted));

    // Anything queued behind it either ran or was caught by the same interrupt; the queue
    // itself keeps going.
    let _ = after.await;
    let row = conn.get("SELECT 3 AS three", ()).await?.ok_or("row")?;
    assert_eq!(row.get("three"), Some(&RowValues::Int(3)));

    // The interrupted ad hoc statement was finalized, so nothing blocks the close.
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn lost_engine_closes_the_connection() -> Result<(), Box<dyn Error>> {
    let recorder = Recorder::default();
    let conn = ConnectionOptionsBuilder::new(":memory:")
        .build_with(RecordingEngine::new(recorder.clone(), Duration::ZERO))
        .await?;
    conn.exec("CREATE TABLE t (v INTEGER)").await?;

    recorder.break_engine();
    let err = conn.exec("INSERT INTO t VALUES (1)").await.expect_err("engine gone");
    assert!(matches!(err, SqlSchedulerError::ConnectionError(_)));
    assert_eq!(conn.state(), ConnectionState::Closed);

    let err = conn.exec("SELECT 1").await.expect_err("closed");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Database is closed");
    Ok(())
}

#[tokio::test]
async fn busy_timeout_can_be_reconfigured() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let path = scratch.db("busy.db");
    let conn = ConnectionOptionsBuilder::new(path.as_str())
        .busy_timeout(Duration::from_secs(5))
        .build()
        .await?;
    conn.exec("CREATE TABLE t (v INTEGER)").await?;
    conn.configure_busy_timeout(Duration::from_millis(10)).await?;

    let blocker = rusqlite::Connection::open(&path)?;
    blocker.execute_batch("BEGIN EXCLUSIVE;")?;
    let err = timeout(
        Duration::from_secs(2),
        conn.run("INSERT INTO t VALUES (1)", ()),
    )
    .await?
    .expect_err("database is locked");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    blocker.execute_batch("ROLLBACK;")?;

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn lifecycle_and_change_events() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    let mut events = conn.subscribe();

    conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").await?;
    conn.run("INSERT INTO t (v) VALUES ('a')", ()).await?;
    conn.run("UPDATE t SET v = 'b' WHERE id = 1", ()).await?;
    conn.run("DELETE FROM t WHERE id = 1", ()).await?;

    let mut kinds = Vec::new();
    while kinds.len() < 3 {
        if let Event::Change {
            kind,
            database,
            table,
            rowid,
        } = next_event(&mut events).await?
        {
            assert_eq!(database, "main");
            assert_eq!(table, "t");
            assert_eq!(rowid, 1);
            kinds.push(kind);
        }
    }
    assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);

    conn.close().await?;
    loop {
        if next_event(&mut events).await? == Event::Close {
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn trace_and_profile_events() -> Result<(), Box<dyn Error>> {
    let conn = ConnectionOptionsBuilder::new(":memory:")
        .trace(true)
        .profile(true)
        .build()
        .await?;
    let mut events = conn.subscribe();

    conn.get("SELECT ? AS v", vec![RowValues::Int(42)]).await?;

    let mut traced = None;
    let mut profiled = None;
    while traced.is_none() || profiled.is_none() {
        match next_event(&mut events).await? {
            Event::Trace { sql } => traced = Some(sql),
            Event::Profile { sql, .. } => profiled = Some(sql),
            _ => {}
        }
    }
    assert_eq!(traced.as_deref(), Some("SELECT 42 AS v"));
    assert_eq!(profiled.as_deref(), Some("SELECT 42 AS v"));

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn unclaimed_failures_are_published() -> Result<(), Box<dyn Error>> {
    let conn = memory().await?;
    let mut events = conn.subscribe();

    drop(conn.exec("THIS IS NOT SQL"));
    conn.wait().await?;

    loop {
        if let Event::Error { message } = next_event(&mut events).await? {
            assert!(message.contains("syntax error"), "{message}");
            break;
        }
    }
    conn.close().await?;
    Ok(())
}
