#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::{Arc, Once};

use tempfile::TempDir;
use tessera::{
    primitives::io::{FaultInjector, FaultyIoProvider},
    EnvOptions, Environment, PageNumber, Result, TesseraError, TxId,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

fn options() -> EnvOptions {
    EnvOptions {
        page_size: 4096,
        manual_flushing: true,
        ..EnvOptions::default()
    }
}

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    faults: FaultInjector,
    env: Environment,
}

fn harness(target: &str) -> Result<Harness> {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("faulty.tsr");
    let faults = FaultInjector::new();
    faults.target(target);
    let env = Environment::open_with_provider(
        &path,
        options(),
        Arc::new(FaultyIoProvider::new(faults.clone())),
    )?;
    Ok(Harness {
        _dir: dir,
        path,
        faults,
        env,
    })
}

fn seed(env: &Environment, value: u8) -> Result<PageNumber> {
    let mut tx = env.begin_write()?;
    let page = tx.allocate_page(1)?;
    tx.modify_page(page)?.fill(value);
    tx.commit()?;
    Ok(page)
}

#[test]
fn journal_sync_failure_poisons_writers_but_not_readers() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.fail_syncs(true);
    let mut tx = h.env.begin_write()?;
    tx.modify_page(page)?.fill(2);
    let err = tx.commit().expect_err("journal sync fails");
    assert!(matches!(err, TesseraError::Io(_)));
    assert!(h.faults.injected() > 0);

    assert!(h.env.is_poisoned());
    assert!(h.env.poison_reason().is_some());
    assert!(matches!(
        h.env.begin_write(),
        Err(TesseraError::StorageFatal(_))
    ));
    assert!(matches!(
        h.env.flush_log_to_data_file(),
        Err(TesseraError::StorageFatal(_))
    ));

    let stats = h.env.stats();
    assert_eq!(stats.last_committed_tx, 1);
    assert_eq!(stats.last_durable_tx, 1);
    assert!(stats.poisoned.is_some());

    let reader = h.env.begin_read()?;
    assert_eq!(reader.snapshot(), TxId(1));
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    Ok(())
}

#[test]
fn failed_journal_write_is_not_replayed() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.fail_writes(true);
    let mut tx = h.env.begin_write()?;
    tx.modify_page(page)?.fill(2);
    assert!(tx.commit().is_err());
    drop(tx);
    let Harness { _dir, path, env, .. } = h;
    drop(env);

    let env = Environment::open(&path, options())?;
    assert!(!env.is_poisoned());
    assert_eq!(env.stats().last_committed_tx, 1);
    let reader = env.begin_read()?;
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    Ok(())
}

#[test]
fn record_whose_sync_failed_is_not_replayed() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.fail_syncs(true);
    let mut tx = h.env.begin_write()?;
    tx.modify_page(page)?.fill(2);
    assert!(matches!(tx.commit(), Err(TesseraError::Io(_))));
    drop(tx);
    let Harness { _dir, path, env, .. } = h;
    drop(env);

    let env = Environment::open(&path, options())?;
    assert!(!env.is_poisoned());
    assert_eq!(env.stats().last_committed_tx, 1);
    let reader = env.begin_read()?;
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    drop(reader);

    // The id of the lost commit is handed out again.
    let mut tx = env.begin_write()?;
    assert_eq!(tx.id(), TxId(2));
    tx.modify_page(page)?.fill(3);
    tx.commit()?;
    Ok(())
}

#[test]
fn dependent_of_a_failed_async_commit_is_rolled_back() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.fail_syncs(true);
    let mut first = h.env.begin_write()?;
    first.modify_page(page)?.fill(2);
    let mut second = first.begin_async_commit_and_start_new()?;
    let extra = second.allocate_page(1)?;
    second.modify_page(extra)?.fill(3);

    let err = second.commit().expect_err("predecessor failed");
    assert!(matches!(err, TesseraError::StorageFatal(_)));
    assert!(matches!(first.end_async_commit(), Err(TesseraError::Io(_))));
    assert!(first.is_completed());

    assert!(h.env.is_poisoned());
    assert!(!h.env.stats().write_lock.held);
    assert!(matches!(
        h.env.begin_write(),
        Err(TesseraError::StorageFatal(_))
    ));

    let reader = h.env.begin_read()?;
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    Ok(())
}

#[test]
fn neither_side_of_a_failed_async_chain_survives_reopen() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.fail_syncs(true);
    let mut first = h.env.begin_write()?;
    first.modify_page(page)?.fill(2);
    let mut second = first.begin_async_commit_and_start_new()?;
    let extra = second.allocate_page(1)?;
    second.modify_page(extra)?.fill(3);
    assert!(second.commit().is_err());
    assert!(first.end_async_commit().is_err());
    drop((first, second));
    let Harness { _dir, path, env, .. } = h;
    drop(env);

    let env = Environment::open(&path, options())?;
    let stats = env.stats();
    assert_eq!(stats.last_committed_tx, 1);
    assert_eq!(stats.next_page, extra.0);
    let reader = env.begin_read()?;
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    assert!(matches!(
        reader.read_page(extra),
        Err(TesseraError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn async_chain_interrupted_by_close_reopens_in_commit_order() -> Result<()> {
    let h = harness("journal")?;
    let page = seed(&h.env, 1)?;

    h.faults.delay_syncs(std::time::Duration::from_millis(50));
    let mut first = h.env.begin_write()?;
    first.modify_page(page)?.fill(2);
    let mut second = first.begin_async_commit_and_start_new()?;
    let extra = second.allocate_page(1)?;
    second.modify_page(extra)?.fill(3);
    assert_eq!(second.commit_async()?, TxId(3));
    // Neither commit is confirmed before the environment goes away.
    drop((first, second));
    let Harness { _dir, path, env, .. } = h;
    drop(env);

    let env = Environment::open(&path, options())?;
    assert_eq!(env.stats().last_committed_tx, 3);
    let reader = env.begin_read()?;
    let later = reader.read_page(extra)?.data()[0];
    let earlier = reader.read_page(page)?.data()[0];
    assert_eq!(later, 3);
    assert_eq!(earlier, 2, "a durable successor implies a durable predecessor");
    Ok(())
}

#[test]
fn failed_header_write_during_flush_poisons_and_keeps_the_journal() -> Result<()> {
    let h = harness("header")?;
    let page = seed(&h.env, 7)?;

    h.faults.fail_writes(true);
    let err = h.env.flush_log_to_data_file().expect_err("header write fails");
    assert!(matches!(err, TesseraError::Io(_)));
    assert!(h.env.is_poisoned());
    assert_eq!(h.env.stats().last_flushed_tx, 0);
    assert!(matches!(
        h.env.begin_write(),
        Err(TesseraError::StorageFatal(_))
    ));

    let Harness { _dir, path, env, .. } = h;
    drop(env);

    let env = Environment::open(&path, options())?;
    assert_eq!(env.stats().last_committed_tx, 1);
    let reader = env.begin_read()?;
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 7));
    Ok(())
}

#[test]
fn open_fails_cleanly_when_the_header_cannot_be_written() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let faults = FaultInjector::new();
    faults.target("header");
    faults.fail_writes(true);
    let result = Environment::open_with_provider(
        dir.path().join("nohdr.tsr"),
        options(),
        Arc::new(FaultyIoProvider::new(faults.clone())),
    );
    assert!(matches!(result, Err(TesseraError::Io(_))));
    assert!(faults.injected() > 0);
}
