#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::thread;

use proptest::prelude::*;
use tempfile::TempDir;
use tessera::{EnvOptions, Environment, PageNumber, Result, Transaction, TxId};

const PAGES: u64 = 4;

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

fn open(dir: &TempDir, data_cache_pages: usize) -> Result<Environment> {
    init_tracing();
    Environment::open(
        dir.path().join("readers.tsr"),
        EnvOptions {
            page_size: 1024,
            manual_flushing: true,
            data_cache_pages,
            ..EnvOptions::default()
        },
    )
}

/// Every page holds the id of the transaction that last wrote it.
fn write_generation(env: &Environment) -> Result<TxId> {
    let mut tx = env.begin_write()?;
    let id = tx.id().0 as u8;
    for page in 1..=PAGES {
        tx.modify_page(PageNumber(page))?.fill(id);
    }
    tx.commit()
}

fn assert_consistent(reader: &Transaction) -> Result<()> {
    let expected = reader.snapshot().0 as u8;
    for page in 1..=PAGES {
        let image = reader.read_page(PageNumber(page))?;
        assert!(
            image.data().iter().all(|b| *b == expected),
            "page {page} diverged from snapshot {}",
            reader.snapshot()
        );
    }
    Ok(())
}

#[test]
fn readers_see_stable_snapshots_while_a_writer_commits_and_flushes() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 16)?;
    {
        let mut tx = env.begin_write()?;
        for _ in 0..PAGES {
            let page = tx.allocate_page(1)?;
            tx.modify_page(page)?.fill(1);
        }
        assert_eq!(tx.commit()?, TxId(1));
    }

    let done = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let mut readers = Vec::new();
        for _ in 0..4 {
            readers.push(scope.spawn(|| -> Result<u64> {
                let mut checks = 0;
                loop {
                    let reader = env.begin_read()?;
                    assert_consistent(&reader)?;
                    // A second pass over the same snapshot must agree.
                    assert_consistent(&reader)?;
                    checks += 1;
                    if done.load(Ordering::Acquire) {
                        return Ok(checks);
                    }
                }
            }));
        }
        let flusher = scope.spawn(|| -> Result<()> {
            while !done.load(Ordering::Acquire) {
                env.flush_log_to_data_file()?;
                thread::yield_now();
            }
            Ok(())
        });

        for _ in 2..=60 {
            write_generation(&env)?;
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            let checks = reader.join().expect("reader panicked")?;
            assert!(checks > 0);
        }
        flusher.join().expect("flusher panicked")
    })?;

    env.flush_log_to_data_file()?;
    let stats = env.stats();
    assert_eq!(stats.last_flushed_tx, 60);
    assert_eq!(stats.readers.active, 0);
    let reader = env.begin_read()?;
    assert_consistent(&reader)?;
    Ok(())
}

#[test]
fn long_lived_reader_outlives_many_flushes() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let env = open(&dir, 0)?;
    {
        let mut tx = env.begin_write()?;
        for _ in 0..PAGES {
            let page = tx.allocate_page(1)?;
            tx.modify_page(page)?.fill(1);
        }
        tx.commit()?;
    }
    let old = env.begin_read()?;
    for _ in 0..10 {
        write_generation(&env)?;
        env.flush_log_to_data_file()?;
    }
    assert_eq!(env.stats().last_flushed_tx, 1);
    assert_consistent(&old)?;
    drop(old);

    env.flush_log_to_data_file()?;
    assert_eq!(env.stats().last_flushed_tx, 11);
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Commit,
    OpenReader,
    CloseReader(usize),
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Commit),
        2 => Just(Op::OpenReader),
        2 => (0usize..8).prop_map(Op::CloseReader),
        1 => Just(Op::Flush),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn interleaved_readers_match_the_model(ops in proptest::collection::vec(op(), 1..40)) {
        let dir = TempDir::new().expect("tempdir");
        let env = open(&dir, 8).expect("open");
        {
            let mut tx = env.begin_write().expect("begin");
            for _ in 0..PAGES {
                let page = tx.allocate_page(1).expect("allocate");
                tx.modify_page(page).expect("modify").fill(1);
            }
            tx.commit().expect("commit");
        }

        let mut readers: BTreeMap<usize, Transaction> = BTreeMap::new();
        let mut next_reader = 0usize;
        let mut committed = 1u64;
        for op in ops {
            match op {
                Op::Commit => {
                    committed = write_generation(&env).expect("commit").0;
                }
                Op::OpenReader => {
                    let reader = env.begin_read().expect("reader");
                    prop_assert_eq!(reader.snapshot(), TxId(committed));
                    readers.insert(next_reader, reader);
                    next_reader += 1;
                }
                Op::CloseReader(slot) => {
                    let key = readers.keys().nth(slot % readers.len().max(1)).copied();
                    if let Some(key) = key {
                        readers.remove(&key);
                    }
                }
                Op::Flush => {
                    let report = env.flush_log_to_data_file().expect("flush");
                    let bound = readers
                        .values()
                        .map(|r| r.snapshot().0)
                        .min()
                        .unwrap_or(committed);
                    prop_assert!(report.flushed_up_to <= bound);
                }
            }
            for reader in readers.values() {
                assert_consistent(reader).expect("consistent read");
            }
        }
        prop_assert_eq!(env.stats().readers.active, readers.len() as u64);
    }
}
