#![allow(missing_docs)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tessera::{EnvOptions, Environment, PageNumber, Result, TxId};

const PAGE: usize = 4096;

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

fn manual() -> EnvOptions {
    EnvOptions {
        page_size: PAGE as u32,
        manual_flushing: true,
        ..EnvOptions::default()
    }
}

fn open(dir: &TempDir, options: EnvOptions) -> Result<Environment> {
    init_tracing();
    Environment::open(dir.path().join("flush.tsr"), options)
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed ^ (i as u8).wrapping_mul(31)).collect()
}

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn flush_installs_pages_and_releases_scratch_slots() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, manual())?;

    let mut expected = Vec::new();
    for seed in 1..=3u8 {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        let image = pattern(seed, PAGE);
        tx.modify_page(page)?.copy_from_slice(&image);
        tx.commit()?;
        expected.push((page, image));
    }

    let slots: Vec<_> = expected
        .iter()
        .map(|(page, _)| env.unflushed_slot(*page).expect("unflushed version"))
        .collect();
    for slot in &slots {
        assert_eq!(env.scratch_ref_count(*slot), 1);
    }
    for (page, _) in &expected {
        assert!(env.read_flushed_page(*page)?.iter().all(|b| *b == 0));
    }

    let report = env.flush_log_to_data_file()?;
    assert_eq!(report.previous, 0);
    assert_eq!(report.flushed_up_to, 3);
    assert_eq!(report.runs_written, 3);
    assert_eq!(report.slots_released, 3);

    for ((page, image), slot) in expected.iter().zip(&slots) {
        assert_eq!(&env.read_flushed_page(*page)?, image);
        assert_eq!(env.scratch_ref_count(*slot), 0);
        assert!(env.unflushed_slot(*page).is_none());
    }
    let stats = env.stats();
    assert_eq!(stats.last_flushed_tx, 3);
    assert_eq!(stats.unflushed_versions, 0);
    assert_eq!(stats.scratch.live_slots, 0);
    assert_eq!(stats.flushes, 1);

    // Reads now come from the data file.
    let reader = env.begin_read()?;
    for (page, image) in &expected {
        assert_eq!(reader.read_page(*page)?.data(), &image[..]);
    }
    Ok(())
}

#[test]
fn newest_version_wins_when_a_page_changed_repeatedly() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, manual())?;
    let page = {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        tx.commit()?;
        page
    };
    for seed in 10..15u8 {
        let mut tx = env.begin_write()?;
        tx.modify_page(page)?.copy_from_slice(&pattern(seed, PAGE));
        tx.commit()?;
    }
    assert_eq!(env.stats().unflushed_versions, 6);

    env.flush_log_to_data_file()?;
    assert_eq!(env.read_flushed_page(page)?, pattern(14, PAGE));
    Ok(())
}

#[test]
fn overflow_run_is_written_at_consecutive_offsets() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, manual())?;
    let image = pattern(0x33, 3 * PAGE);
    let first = {
        let mut tx = env.begin_write()?;
        let first = tx.allocate_page(3)?;
        tx.modify_pages(first, 3)?.copy_from_slice(&image);
        tx.commit()?;
        first
    };

    env.flush_log_to_data_file()?;
    for (i, chunk) in image.chunks(PAGE).enumerate() {
        let page = PageNumber(first.0 + i as u64);
        assert_eq!(env.read_flushed_page(page)?, chunk);
    }
    Ok(())
}

#[test]
fn open_reader_bounds_the_flush() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, manual())?;
    let page = {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        tx.modify_page(page)?.fill(1);
        tx.commit()?;
        page
    };

    let reader = env.begin_read()?;
    assert_eq!(reader.snapshot(), TxId(1));
    {
        let mut tx = env.begin_write()?;
        tx.modify_page(page)?.fill(2);
        tx.commit()?;
    }

    let report = env.flush_log_to_data_file()?;
    assert_eq!(report.flushed_up_to, 1);
    assert!(env.read_flushed_page(page)?.iter().all(|b| *b == 1));
    assert!(env.unflushed_slot(page).is_some());

    // Nothing more can move while the reader stays.
    assert!(env.flush_log_to_data_file()?.is_noop());
    assert!(reader.read_page(page)?.data().iter().all(|b| *b == 1));
    drop(reader);

    let report = env.flush_log_to_data_file()?;
    assert_eq!((report.previous, report.flushed_up_to), (1, 2));
    assert!(env.read_flushed_page(page)?.iter().all(|b| *b == 2));
    Ok(())
}

#[test]
fn flush_retires_the_journal() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(
        &dir,
        EnvOptions {
            journal_size_limit: 4 * PAGE as u64,
            ..manual()
        },
    )?;
    let page = {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        tx.commit()?;
        page
    };
    for seed in 0..8u8 {
        let mut tx = env.begin_write()?;
        tx.modify_page(page)?.fill(seed);
        tx.commit()?;
    }
    let before = env.stats().journal;
    assert!(before.files > 1, "journal should have rotated: {before:?}");

    let report = env.flush_log_to_data_file()?;
    assert_eq!(report.journal_files_retired, before.files);
    let after = env.stats().journal;
    assert_eq!(after.files, 1);

    let remaining = std::fs::read_dir(env.journal_dir())?.count();
    assert_eq!(remaining, 1);
    Ok(())
}

#[test]
fn empty_flush_is_a_noop() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, manual())?;
    let report = env.flush_log_to_data_file()?;
    assert!(report.is_noop());
    assert_eq!(report.flushed_up_to, 0);
    assert_eq!(env.stats().flushes, 0);
    Ok(())
}

#[test]
fn background_flush_runs_on_its_interval() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(
        &dir,
        EnvOptions {
            manual_flushing: false,
            flush_interval_ms: 20,
            ..manual()
        },
    )?;
    let page = {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        tx.modify_page(page)?.fill(0xEE);
        tx.commit()?;
        page
    };

    assert!(wait_until(|| env.stats().last_flushed_tx == 1));
    assert!(env.read_flushed_page(page)?.iter().all(|b| *b == 0xEE));
    env.close()?;
    Ok(())
}

#[test]
fn dirty_threshold_triggers_an_early_flush() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(
        &dir,
        EnvOptions {
            manual_flushing: false,
            flush_interval_ms: 60_000,
            flush_dirty_pages_threshold: 2,
            ..manual()
        },
    )?;
    for _ in 0..2 {
        let mut tx = env.begin_write()?;
        tx.allocate_page(1)?;
        tx.commit()?;
    }

    assert!(wait_until(|| env.stats().last_flushed_tx == 2));
    assert_eq!(env.stats().unflushed_versions, 0);
    Ok(())
}
