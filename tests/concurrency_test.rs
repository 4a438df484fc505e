mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::*;
use tessera::index::document::Field;
use tessera::index::policy::ConsolidateAll;
use tessera::index::writer::OpenMode;

#[test]
fn test_concurrent_inserts_share_one_commit() {
    init_logging();
    let storage = memory_storage();
    let writer = open_writer(&storage, OpenMode::Create);
    let per_thread = 250;

    thread::scope(|scope| {
        for t in 0..2 {
            let writer = &writer;
            scope.spawn(move || {
                for i in 0..per_thread {
                    let value = format!("t{t}-{i}");
                    let mut docs = writer.documents();
                    let inserted = docs
                        .insert(|doc| {
                            doc.insert(&Field::indexed_stored("name", [&value], value.clone()));
                        })
                        .unwrap();
                    assert!(inserted);
                }
            });
        }
    });
    writer.commit().unwrap();

    let reader = open_reader(&storage).unwrap();
    assert!((1..=2).contains(&reader.size()));
    assert_eq!(reader.docs_count(), 2 * per_thread as u64);
}

#[test]
fn test_readers_never_see_partial_batches() {
    init_logging();
    let storage = memory_storage();
    let writer = open_writer(&storage, OpenMode::Create);
    writer.commit().unwrap();

    let batch = 10;
    let batches = 30;
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            for b in 0..batches {
                {
                    let mut docs = writer.documents();
                    for i in 0..batch {
                        let value = format!("b{b}-{i}");
                        docs.insert(|doc| {
                            doc.insert(&Field::stored("name", value.clone()));
                        })
                        .unwrap();
                    }
                }
                if b % 3 == 0 {
                    writer.commit().unwrap();
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                writer.commit().unwrap();
                thread::yield_now();
            }
        });

        scope.spawn(|| {
            let mut reader = open_reader(&storage).unwrap();
            while !done.load(Ordering::SeqCst) {
                reader = reader.reopen().unwrap();
                assert_eq!(reader.live_docs_count() % batch as u64, 0);
            }
        });
    });

    writer.commit().unwrap();
    let reader = open_reader(&storage).unwrap();
    assert_eq!(reader.live_docs_count(), (batch * batches) as u64);
}

#[test]
fn test_consolidation_alongside_writes() {
    init_logging();
    let storage = memory_storage();
    let writer = open_writer(&storage, OpenMode::Create);
    let rounds = 20;
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            for r in 0..rounds {
                insert(&writer, &format!("r{r}"));
                writer.commit().unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                writer.consolidate(&ConsolidateAll).unwrap();
                thread::yield_now();
            }
        });
    });

    writer.commit().unwrap();
    let reader = open_reader(&storage).unwrap();
    assert_eq!(reader.live_docs_count(), rounds as u64);

    let mut names: Vec<String> = stored_names(&reader).into_iter().flatten().collect();
    names.sort();
    let mut expected: Vec<String> = (0..rounds).map(|r| format!("r{r}")).collect();
    expected.sort();
    assert_eq!(names, expected);
}
