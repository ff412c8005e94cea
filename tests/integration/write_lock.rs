#![allow(missing_docs)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tessera::{
    CancellationToken, EnvOptions, Environment, Result, TesseraError, TxMode, WriteOptions,
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

fn open(dir: &TempDir, timeout_ms: Option<u64>) -> Result<Environment> {
    init_tracing();
    Environment::open(
        dir.path().join("lock.tsr"),
        EnvOptions {
            page_size: 4096,
            manual_flushing: true,
            write_lock_timeout_ms: timeout_ms,
            ..EnvOptions::default()
        },
    )
}

#[test]
fn zero_timeout_fails_immediately_while_a_writer_is_active() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, Some(0))?;

    let mut first = env.begin_write()?;
    first.allocate_page(1)?;

    let started = Instant::now();
    let err = env.begin_write().expect_err("lock is held");
    assert!(matches!(err, TesseraError::Timeout(waited) if waited == Duration::ZERO));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(env.stats().write_lock.timeouts, 1);

    first.commit()?;
    let mut second = env.begin_write()?;
    second.rollback()?;
    Ok(())
}

#[test]
fn per_call_timeout_overrides_the_default() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, None)?;
    let _holder = env.begin_write()?;

    let started = Instant::now();
    let err = env
        .begin_write_with(WriteOptions::default().with_timeout(Duration::from_millis(50)))
        .expect_err("lock is held");
    assert!(matches!(err, TesseraError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    Ok(())
}

#[test]
fn cancelled_wait_gives_up_without_disturbing_the_holder() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, None)?;
    let mut holder = env.begin_write()?;
    let page = holder.allocate_page(1)?;

    let token = CancellationToken::new();
    let outcome = thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            env.begin_write_with(WriteOptions::default().with_cancel(token.clone()))
                .map(|_| ())
        });
        thread::sleep(Duration::from_millis(30));
        token.cancel();
        waiter.join().expect("waiter panicked")
    });
    assert!(matches!(outcome, Err(TesseraError::Cancelled)));

    holder.modify_page(page)?[0] = 1;
    holder.commit()?;
    Ok(())
}

#[test]
fn blocked_writer_proceeds_after_commit() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, None)?;
    let mut first = env.begin_write()?;
    let page = first.allocate_page(1)?;
    first.modify_page(page)?[0] = 5;

    let seen = thread::scope(|scope| -> Result<u8> {
        let waiter = scope.spawn(|| -> Result<u8> {
            let mut second = env.begin_write()?;
            let value = second.read_page(page)?.data()[0];
            second.rollback()?;
            Ok(value)
        });
        thread::sleep(Duration::from_millis(30));
        first.commit()?;
        waiter.join().expect("waiter panicked")
    })?;
    assert_eq!(seen, 5);
    Ok(())
}

#[test]
fn dropping_a_writer_releases_the_lock() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, Some(0))?;
    {
        let mut tx = env.begin_write()?;
        tx.allocate_page(2)?;
    }
    assert!(!env.stats().write_lock.held);
    let mut tx = env.begin_write()?;
    assert_eq!(tx.allocate_page(2)?.0, 1);
    Ok(())
}

#[test]
fn misuse_is_reported_as_a_concurrency_violation() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, Some(0))?;

    let mut reader = env.begin_transaction(TxMode::Read)?;
    assert_eq!(reader.mode(), TxMode::Read);
    assert!(matches!(
        reader.allocate_page(1),
        Err(TesseraError::ConcurrencyViolation(_))
    ));
    assert!(matches!(
        reader.end_async_commit(),
        Err(TesseraError::ConcurrencyViolation(_))
    ));
    assert!(matches!(
        reader.begin_async_commit_and_start_new(),
        Err(TesseraError::ConcurrencyViolation(_))
    ));

    let mut writer = env.begin_write()?;
    let page = writer.allocate_page(1)?;
    writer.commit()?;
    assert!(matches!(
        writer.commit(),
        Err(TesseraError::ConcurrencyViolation(_))
    ));
    assert!(matches!(
        writer.modify_page(page),
        Err(TesseraError::ConcurrencyViolation(_))
    ));
    assert!(matches!(
        writer.rollback(),
        Err(TesseraError::ConcurrencyViolation(_))
    ));

    let mut rolled = env.begin_write()?;
    rolled.rollback()?;
    assert!(matches!(
        rolled.end_async_commit(),
        Err(TesseraError::ConcurrencyViolation(_))
    ));
    Ok(())
}

#[test]
fn invalid_page_arguments_are_rejected() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, Some(0))?;
    let mut tx = env.begin_write()?;
    assert!(matches!(tx.allocate_page(0), Err(TesseraError::Invalid(_))));
    assert!(matches!(
        tx.read_page(tessera::PageNumber(0)),
        Err(TesseraError::Invalid(_))
    ));
    assert!(matches!(
        tx.modify_page(tessera::PageNumber(40)),
        Err(TesseraError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn unbounded_timeouts_wait_instead_of_overflowing() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, Some(u64::MAX))?;
    let mut first = env.begin_write()?;
    let page = first.allocate_page(1)?;
    first.modify_page(page)?[0] = 7;

    let seen = thread::scope(|scope| -> Result<u8> {
        let waiter = scope.spawn(|| -> Result<u8> {
            let mut second =
                env.begin_write_with(WriteOptions::default().with_timeout(Duration::MAX))?;
            let value = second.read_page(page)?.data()[0];
            second.rollback()?;
            Ok(value)
        });
        thread::sleep(Duration::from_millis(30));
        first.commit()?;
        waiter.join().expect("waiter panicked")
    })?;
    assert_eq!(seen, 7);
    assert_eq!(env.stats().write_lock.timeouts, 0);
    Ok(())
}
