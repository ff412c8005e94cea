#![allow(missing_docs)]

use std::sync::Once;

use tempfile::TempDir;
use tessera::{EnvOptions, Environment, PageNumber, Result, TxId};

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

fn open(dir: &TempDir, reclaim_lag: u64) -> Result<Environment> {
    init_tracing();
    Environment::open(
        dir.path().join("reclaim.tsr"),
        EnvOptions {
            page_size: 4096,
            manual_flushing: true,
            reclaim_lag,
            ..EnvOptions::default()
        },
    )
}

fn commit_new_page(env: &Environment, fill: u8) -> Result<PageNumber> {
    let mut tx = env.begin_write()?;
    let page = tx.allocate_page(1)?;
    tx.modify_page(page)?.fill(fill);
    tx.commit()?;
    Ok(page)
}

fn commit_free(env: &Environment, page: PageNumber) -> Result<TxId> {
    let mut tx = env.begin_write()?;
    tx.free_page(page)?;
    tx.commit()
}

#[test]
fn freed_page_is_not_reused_while_an_older_reader_is_open() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 0)?;

    let page = commit_new_page(&env, 0xAA)?;
    assert_eq!(page, PageNumber(1));

    let reader = env.begin_read()?;
    assert_eq!(reader.snapshot(), TxId(1));

    assert_eq!(commit_free(&env, page)?, TxId(2));
    assert_eq!(env.stats().pending_free_pages, 1);

    let mut tx3 = env.begin_write()?;
    let fresh = tx3.allocate_page(1)?;
    assert_ne!(fresh, page);
    tx3.commit()?;

    // The old snapshot still sees the freed page's last contents.
    let image = reader.read_page(page)?;
    assert!(image.data().iter().all(|b| *b == 0xAA));
    drop(reader);

    let mut tx4 = env.begin_write()?;
    assert_eq!(tx4.allocate_page(1)?, page);
    tx4.rollback()?;
    Ok(())
}

#[test]
fn writer_cannot_touch_freed_pages() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 0)?;
    let page = commit_new_page(&env, 1)?;

    let mut tx = env.begin_write()?;
    tx.free_page(page)?;
    assert!(tx.read_page(page).is_err());
    assert!(tx.modify_page(page).is_err());
    assert!(tx.free_page(page).is_err());
    tx.rollback()?;

    // Rolling back the free keeps the page live.
    let mut tx = env.begin_write()?;
    assert_eq!(tx.read_page(page)?.data()[0], 1);
    tx.rollback()?;
    Ok(())
}

#[test]
fn reclaim_lag_holds_pages_back_for_extra_epochs() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 2)?;

    let page = commit_new_page(&env, 3)?;
    assert_eq!(commit_free(&env, page)?, TxId(2));

    let second = commit_new_page(&env, 4)?;
    let third = commit_new_page(&env, 5)?;
    assert_ne!(second, page);
    assert_ne!(third, page);

    let mut tx = env.begin_write()?;
    assert_eq!(tx.snapshot(), TxId(4));
    assert_eq!(tx.allocate_page(1)?, page);
    tx.commit()?;
    assert_eq!(env.stats().pending_free_pages, 0);
    Ok(())
}

#[test]
fn freed_overflow_run_is_reused_for_smaller_allocations() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 0)?;

    let run = {
        let mut tx = env.begin_write()?;
        let run = tx.allocate_page(4)?;
        tx.modify_pages(run, 4)?.fill(8);
        tx.commit()?;
        run
    };
    {
        let mut tx = env.begin_write()?;
        tx.free_pages(run, 4)?;
        tx.commit()?;
    }
    assert_eq!(env.stats().free_pages + env.stats().pending_free_pages, 4);

    let mut tx = env.begin_write()?;
    let a = tx.allocate_page(2)?;
    let b = tx.allocate_page(2)?;
    assert!(a.0 >= run.0 && a.0 + 2 <= run.0 + 4);
    assert!(b.0 >= run.0 && b.0 + 2 <= run.0 + 4);
    assert_ne!(a, b);
    // Reused pages start zeroed even though the old run held data.
    assert!(tx.read_pages(a, 2)?.data().iter().all(|byte| *byte == 0));
    tx.commit()?;
    Ok(())
}
