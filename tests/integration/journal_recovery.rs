#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::TempDir;
use tessera::{
    primitives::journal, storage::journal_dir_for, EnvOptions, Environment, PageNumber, Result,
    TxId,
};

const PAGE: u32 = 4096;

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
        page_size: PAGE,
        manual_flushing: true,
        ..EnvOptions::default()
    }
}

fn setup() -> (TempDir, PathBuf) {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("recovery.tsr");
    (dir, path)
}

/// Commits one transaction per value, each rewriting the first byte of `page`.
fn commit_values(env: &Environment, page: PageNumber, values: &[u8]) -> Result<()> {
    for value in values {
        let mut tx = env.begin_write()?;
        tx.modify_page(page)?.fill(*value);
        tx.commit()?;
    }
    Ok(())
}

fn seed(env: &Environment) -> Result<PageNumber> {
    let mut tx = env.begin_write()?;
    let page = tx.allocate_page(1)?;
    tx.commit()?;
    Ok(page)
}

fn journal_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(journal_dir_for(path))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    files.sort();
    Ok(files)
}

fn first_byte(env: &Environment, page: PageNumber) -> Result<u8> {
    let reader = env.begin_read()?;
    let value = reader.read_page(page)?.data()[0];
    Ok(value)
}

#[test]
fn reopen_replays_unflushed_commits() -> Result<()> {
    let (_dir, path) = setup();
    let page = {
        let env = Environment::open(&path, options())?;
        let page = seed(&env)?;
        commit_values(&env, page, &[1, 2, 3])?;
        assert_eq!(env.stats().last_flushed_tx, 0);
        page
    };

    let env = Environment::open(&path, options())?;
    let stats = env.stats();
    assert_eq!(stats.last_committed_tx, 4);
    assert_eq!(stats.last_flushed_tx, 4);
    assert_eq!(stats.unflushed_versions, 0);
    assert_eq!(first_byte(&env, page)?, 3);
    assert_eq!(env.read_flushed_page(page)?[0], 3);

    // Ids continue after the recovered history.
    let mut tx = env.begin_write()?;
    assert_eq!(tx.id(), TxId(5));
    tx.rollback()?;
    Ok(())
}

#[test]
fn torn_tail_record_is_discarded() -> Result<()> {
    let (_dir, path) = setup();
    let page = {
        let env = Environment::open(&path, options())?;
        let page = seed(&env)?;
        commit_values(&env, page, &[1, 2, 3])?;
        page
    };

    let files = journal_files(&path)?;
    assert_eq!(files.len(), 1);
    let file = OpenOptions::new().write(true).open(&files[0])?;
    let len = file.metadata()?.len();
    file.set_len(len - 10)?;
    drop(file);

    let summary = journal::inspect(&journal_dir_for(&path), PAGE)?;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].records.len(), 3);
    assert!(summary[0].damage.is_some());

    let env = Environment::open(&path, options())?;
    assert_eq!(env.stats().last_committed_tx, 3);
    assert_eq!(first_byte(&env, page)?, 2);

    commit_values(&env, page, &[9])?;
    assert_eq!(env.stats().last_committed_tx, 4);
    drop(env);

    let env = Environment::open(&path, options())?;
    assert_eq!(first_byte(&env, page)?, 9);
    Ok(())
}

#[test]
fn corrupted_record_checksum_stops_replay() -> Result<()> {
    let (_dir, path) = setup();
    let page = {
        let env = Environment::open(&path, options())?;
        let page = seed(&env)?;
        commit_values(&env, page, &[5, 6])?;
        page
    };

    let files = journal_files(&path)?;
    let mut bytes = fs::read(&files[0])?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&files[0], &bytes)?;

    let env = Environment::open(&path, options())?;
    assert_eq!(env.stats().last_committed_tx, 2);
    assert_eq!(first_byte(&env, page)?, 5);
    Ok(())
}

#[test]
fn rotated_and_compressed_journal_replays_in_order() -> Result<()> {
    let (_dir, path) = setup();
    let opts = EnvOptions {
        journal_size_limit: 4 * PAGE as u64,
        journal_compression: true,
        ..options()
    };
    let (first, run) = {
        let env = Environment::open(&path, opts.clone())?;
        let first = seed(&env)?;
        let run = {
            let mut tx = env.begin_write()?;
            let run = tx.allocate_page(4)?;
            for (i, byte) in tx.modify_pages(run, 4)?.iter_mut().enumerate() {
                *byte = (i % 253) as u8;
            }
            tx.commit()?;
            run
        };
        for value in 1..=12u8 {
            let mut tx = env.begin_write()?;
            // Incompressible enough to force rotation.
            for (i, byte) in tx.modify_page(first)?.iter_mut().enumerate() {
                *byte = value.wrapping_mul(i as u8 | 1) ^ (i >> 3) as u8;
            }
            tx.commit()?;
        }
        (first, run)
    };
    assert!(journal_files(&path)?.len() > 1);

    let env = Environment::open(&path, opts)?;
    assert_eq!(env.stats().last_committed_tx, 14);
    let reader = env.begin_read()?;
    let page = reader.read_page(first)?;
    assert!(page
        .data()
        .iter()
        .enumerate()
        .all(|(i, b)| *b == 12u8.wrapping_mul(i as u8 | 1) ^ (i >> 3) as u8));
    let overflow = reader.read_pages(run, 4)?;
    assert!(overflow
        .data()
        .iter()
        .enumerate()
        .all(|(i, b)| *b == (i % 253) as u8));
    Ok(())
}

#[test]
fn recovery_is_idempotent_across_reopens() -> Result<()> {
    let (_dir, path) = setup();
    let page = {
        let env = Environment::open(&path, options())?;
        let page = seed(&env)?;
        commit_values(&env, page, &[1, 2])?;
        env.flush_log_to_data_file()?;
        commit_values(&env, page, &[3, 4])?;
        page
    };

    for _ in 0..3 {
        let env = Environment::open(&path, options())?;
        assert_eq!(env.stats().last_committed_tx, 5);
        assert_eq!(first_byte(&env, page)?, 4);
        env.close()?;
    }

    let env = Environment::open(&path, options())?;
    let env_id = env.env_id();
    commit_values(&env, page, &[7])?;
    drop(env);
    let env = Environment::open(&path, options())?;
    assert_eq!(env.env_id(), env_id);
    assert_eq!(env.stats().last_committed_tx, 6);
    assert_eq!(first_byte(&env, page)?, 7);
    Ok(())
}

#[test]
fn freed_pages_stay_free_after_recovery() -> Result<()> {
    let (_dir, path) = setup();
    let (kept, freed) = {
        let env = Environment::open(&path, options())?;
        let mut tx = env.begin_write()?;
        let kept = tx.allocate_page(1)?;
        let freed = tx.allocate_page(1)?;
        tx.commit()?;
        let mut tx = env.begin_write()?;
        tx.free_page(freed)?;
        tx.commit()?;
        (kept, freed)
    };

    let env = Environment::open(&path, options())?;
    assert_eq!(env.stats().free_pages, 1);
    let mut tx = env.begin_write()?;
    assert!(tx.read_page(freed).is_err());
    assert!(tx.read_page(kept).is_ok());
    assert_eq!(tx.allocate_page(1)?, freed);
    Ok(())
}
