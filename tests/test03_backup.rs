mod common;

use std::error::Error;
use std::time::Duration;

use sql_scheduler::prelude::*;

use common::{Scratch, count_rows};

async fn seeded(path: &str, rows: i64) -> Result<Connection, SqlSchedulerError> {
    let conn = ConnectionOptionsBuilder::new(path)
        .busy_timeout(Duration::from_millis(20))
        .build()
        .await?;
    conn.exec("PRAGMA page_size = 1024; CREATE TABLE foo (txt TEXT)")
        .await?;
    let insert = conn.prepare("INSERT INTO foo VALUES (?)").await?;
    for i in 0..rows {
        insert
            .run(vec![RowValues::Text(format!("{i:0>200}"))])
            .await?;
    }
    insert.finalize().await?;
    Ok(conn)
}

#[tokio::test]
async fn full_backup_copies_every_row() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(&scratch.db("source.db"), 50).await?;
    let destination = scratch.db("backup.db");

    let backup = conn.backup(destination.as_str());
    assert!(backup.step(-1).await?);
    assert!(backup.is_completed());
    assert_eq!(backup.remaining(), 0);
    assert!(backup.page_count() > 0);

    // Completed sessions reject further steps; finish stays harmless.
    let err = backup.step(1).await.expect_err("backup already completed");
    assert_eq!(err.to_string(), "SQLITE_MISUSE: Backup is already finished");
    backup.finish().await?;

    assert_eq!(count_rows(&destination, "foo"), 50);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn incremental_steps_report_progress() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(&scratch.db("source.db"), 200).await?;
    let destination = scratch.db("incremental.db");

    let backup = conn.backup(destination.as_str());
    assert_eq!(backup.remaining(), -1);

    let mut steps = 0;
    let mut last_remaining = i32::MAX;
    while !backup.step(5).await? {
        steps += 1;
        assert!(backup.is_idle());
        let remaining = backup.remaining();
        assert!(remaining < last_remaining, "progress went backwards");
        assert_eq!(backup.page_count() - remaining, steps * 5);
        last_remaining = remaining;
    }
    assert!(steps > 1, "expected several steps, got {steps}");
    assert!(backup.is_completed());

    assert_eq!(count_rows(&destination, "foo"), 200);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn empty_source_completes_in_one_step() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = ConnectionOptionsBuilder::new(scratch.db("empty.db"))
        .build()
        .await?;

    let backup = conn.backup(scratch.db("empty-copy.db"));
    assert!(backup.step(-1).await?);
    assert!(backup.is_completed());

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn restore_from_file_into_connection() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let archive = scratch.db("archive.db");
    {
        let source = seeded(&archive, 7).await?;
        source.close().await?;
    }

    let conn = ConnectionOptionsBuilder::new(scratch.db("live.db"))
        .build()
        .await?;
    let restore = conn.backup_with(BackupRequest::from_file(archive.as_str()));
    assert!(restore.step(-1).await?);

    let row = conn
        .get("SELECT count(*) AS n FROM foo", ())
        .await?
        .ok_or("count row")?;
    assert_eq!(row.get("n"), Some(&RowValues::Int(7)));
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn busy_destination_is_retryable() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(&scratch.db("source.db"), 20).await?;
    let destination = scratch.db("locked.db");

    let blocker = rusqlite::Connection::open(&destination)?;
    blocker.execute_batch("CREATE TABLE placeholder (x); BEGIN EXCLUSIVE;")?;

    let backup = conn.backup(destination.as_str());
    let err = backup.step(-1).await.expect_err("destination is locked");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    assert!(backup.is_idle(), "retryable error should leave the session idle");
    assert!(backup.message().is_none());

    // Close is refused while the session is unfinished.
    let err = conn.close().await.expect_err("backup still running");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    assert_eq!(conn.state(), ConnectionState::Open);

    blocker.execute_batch("COMMIT;")?;
    drop(blocker);
    assert!(backup.step(-1).await?);
    assert!(backup.is_completed());
    assert_eq!(count_rows(&destination, "foo"), 20);

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn empty_retry_set_makes_contention_terminal() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(&scratch.db("source.db"), 20).await?;
    let destination = scratch.db("locked.db");

    let blocker = rusqlite::Connection::open(&destination)?;
    blocker.execute_batch("CREATE TABLE placeholder (x); BEGIN EXCLUSIVE;")?;

    let backup = conn.backup(destination.as_str());
    assert_eq!(backup.retry_errors(), sql_scheduler::backup::default_retry_errors());
    backup.set_retry_errors(Vec::<ErrorCode>::new());

    let err = backup.step(-1).await.expect_err("destination is locked");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    assert!(backup.is_failed());
    assert!(backup.message().is_some_and(|msg| msg.contains("locked")));

    let err = backup.step(-1).await.expect_err("session failed");
    assert!(err.is_misuse());

    // Without a retry set the session is only released by finish.
    let err = conn.close().await.expect_err("backup not released");
    assert_eq!(err.code(), Some(ErrorCode::Busy));
    backup.finish().await?;
    assert!(backup.is_failed());
    backup.finish().await?;

    blocker.execute_batch("ROLLBACK;")?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn in_memory_database_backs_up_to_file() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(":memory:", 40).await?;
    let destination = scratch.db("snapshot.db");

    let backup = conn.backup(destination.as_str());
    assert!(!backup.step(2).await?);
    // The connection stays usable while the session is open.
    conn.run("INSERT INTO foo VALUES ('late')", ()).await?;
    while !backup.step(2).await? {}
    assert!(backup.is_completed());

    assert_eq!(count_rows(&destination, "foo"), 41);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn temp_and_attached_schemas_back_up() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = ConnectionOptionsBuilder::new(scratch.db("main.db"))
        .build()
        .await?;
    conn.exec(
        "CREATE TEMP TABLE scratch (v INTEGER); \
         INSERT INTO scratch VALUES (1), (2), (3); \
         ATTACH ':memory:' AS aux; \
         CREATE TABLE aux.side (v INTEGER); \
         INSERT INTO aux.side VALUES (9);",
    )
    .await?;

    let temp_copy = scratch.db("temp-copy.db");
    let temp = conn.backup_with(BackupRequest::to_file(temp_copy.as_str()).source_name("temp"));
    let aux_copy = scratch.db("aux-copy.db");
    let aux = conn.backup_with(BackupRequest::to_file(aux_copy.as_str()).source_name("aux"));
    assert!(temp.step(-1).await?);
    assert!(aux.step(-1).await?);

    assert_eq!(count_rows(&temp_copy, "scratch"), 3);
    assert_eq!(count_rows(&aux_copy, "side"), 1);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn restoring_into_memory_is_refused() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let archive = scratch.db("archive.db");
    {
        let source = seeded(&archive, 3).await?;
        source.close().await?;
    }
    let conn = ConnectionOptionsBuilder::new(":memory:").build().await?;

    let restore = conn.backup_with(BackupRequest::from_file(archive.as_str()));
    assert!(restore.step(-1).await.is_err());
    assert!(restore.is_failed());
    assert!(
        restore
            .message()
            .is_some_and(|msg| msg.contains("file-backed")),
        "{:?}",
        restore.message()
    );

    restore.finish().await?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn unfinished_session_can_be_finished_early() -> Result<(), Box<dyn Error>> {
    let scratch = Scratch::new();
    let conn = seeded(&scratch.db("source.db"), 200).await?;

    let backup = conn.backup(scratch.db("partial.db"));
    assert!(!backup.step(1).await?);
    backup.finish().await?;
    assert!(backup.is_completed());
    let err = backup.step(1).await.expect_err("finished");
    assert!(err.is_misuse());

    conn.close().await?;
    Ok(())
}
