//! Criterion benchmarks for Tessera.
//!
//! Covers the hot paths of the engine:
//! - Buffering and committing documents
//! - Applying removals to committed segments
//! - Consolidating segments
//! - Columnstore lookups, cold and cached

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::index::codec::{Codec, DefaultCodec};
use tessera::index::column::{ColumnstoreReader, ColumnstoreWriter};
use tessera::index::document::Field;
use tessera::index::filter::TermFilter;
use tessera::index::policy::ConsolidateAll;
use tessera::index::reader::DirectoryReader;
use tessera::index::writer::{IndexWriter, IndexWriterConfig, OpenMode};
use tessera::storage::Storage;
use tessera::storage::memory::MemoryStorage;

const WORDS: &[&str] = &[
    "segment", "column", "generation", "commit", "flush", "merge", "reader", "writer", "mask",
    "filter", "posting", "payload", "snapshot", "storage", "codec", "policy",
];

/// Generate `count` documents of a few pseudo-random words each.
fn generate_documents(count: usize) -> Vec<Vec<&'static str>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| {
            let len = rng.random_range(3..12);
            (0..len)
                .map(|_| WORDS[rng.random_range(0..WORDS.len())])
                .collect()
        })
        .collect()
}

fn open_writer(storage: &Arc<dyn Storage>, config: IndexWriterConfig) -> IndexWriter {
    let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());
    IndexWriter::open(Arc::clone(storage), codec, OpenMode::Create, config).unwrap()
}

fn index_documents(writer: &IndexWriter, documents: &[Vec<&'static str>]) {
    let mut docs = writer.documents();
    for (i, words) in documents.iter().enumerate() {
        let id = format!("doc{i}");
        docs.insert(|doc| {
            doc.insert(&Field::indexed_stored("id", [&id], id.clone()));
            doc.insert(&Field::indexed("body", words.iter()));
            doc.insert(&Field::stored("body", words.join(" ")));
        })
        .unwrap();
    }
}

/// Benchmark buffering and committing documents.
fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    let documents = generate_documents(1000);

    group.throughput(Throughput::Elements(documents.len() as u64));
    group.bench_function("insert_and_commit_1000", |b| {
        b.iter_batched(
            || {
                let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
                let writer = open_writer(&storage, IndexWriterConfig::default());
                (storage, writer)
            },
            |(_storage, writer)| {
                index_documents(&writer, &documents);
                black_box(writer.commit().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("insert_with_sealing_1000", |b| {
        let config = IndexWriterConfig {
            segment_docs_max: 100,
            ..Default::default()
        };
        b.iter_batched(
            || {
                let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
                let writer = open_writer(&storage, config.clone());
                (storage, writer)
            },
            |(_storage, writer)| {
                index_documents(&writer, &documents);
                black_box(writer.commit().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark removals against committed segments.
fn bench_removals(c: &mut Criterion) {
    let mut group = c.benchmark_group("removals");
    let documents = generate_documents(2000);

    group.bench_function("remove_100_and_commit", |b| {
        b.iter_batched(
            || {
                let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
                let writer = open_writer(&storage, IndexWriterConfig::default());
                index_documents(&writer, &documents);
                writer.commit().unwrap();
                (storage, writer)
            },
            |(_storage, writer)| {
                {
                    let mut docs = writer.documents();
                    for i in (0..2000).step_by(20) {
                        docs.remove(TermFilter::new("id", format!("doc{i}")));
                    }
                }
                black_box(writer.commit().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark merging committed segments.
fn bench_consolidation(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidation");
    group.sample_size(20);
    let documents = generate_documents(2000);

    group.bench_function("consolidate_10_segments", |b| {
        b.iter_batched(
            || {
                let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
                let writer = open_writer(&storage, IndexWriterConfig::default());
                for chunk in documents.chunks(200) {
                    index_documents(&writer, chunk);
                    writer.commit().unwrap();
                }
                (storage, writer)
            },
            |(_storage, writer)| {
                writer.consolidate(&ConsolidateAll).unwrap();
                black_box(writer.commit().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark columnstore lookups.
fn bench_columnstore(c: &mut Criterion) {
    let mut group = c.benchmark_group("columnstore");

    let mut writer = ColumnstoreWriter::new();
    for doc in 1..=10_000u32 {
        if doc % 3 != 0 {
            writer.insert("value", doc, &u64::from(doc).to_le_bytes());
        }
    }
    let bytes = writer.finish().unwrap();

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("random_lookup_cold", |b| {
        b.iter_batched(
            || ColumnstoreReader::from_bytes(bytes.clone()).unwrap(),
            |store| {
                let column = store.column("value").unwrap();
                let values = column.values();
                let mut found = 0;
                for doc in (1..=10_000u32).rev() {
                    found += usize::from(values(doc).is_some());
                }
                black_box(found)
            },
            BatchSize::SmallInput,
        )
    });

    let store = ColumnstoreReader::from_bytes(bytes).unwrap();
    let column = store.column("value").unwrap();
    column.visit(|_, _| true).unwrap();
    group.bench_function("random_lookup_cached", |b| {
        b.iter(|| {
            let values = column.values();
            let mut found = 0;
            for doc in (1..=10_000u32).rev() {
                found += usize::from(values(black_box(doc)).is_some());
            }
            black_box(found)
        })
    });

    group.finish();
}

/// Benchmark opening snapshot readers.
fn bench_reader(c: &mut Criterion) {
    let mut group = c.benchmark_group("reader");
    let documents = generate_documents(2000);

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = open_writer(&storage, IndexWriterConfig::default());
    for chunk in documents.chunks(100) {
        index_documents(&writer, chunk);
        writer.commit().unwrap();
    }
    let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());

    group.bench_function("open_20_segments", |b| {
        b.iter(|| {
            let reader = DirectoryReader::open(Arc::clone(&storage), Arc::clone(&codec)).unwrap();
            black_box(reader.live_docs_count())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_indexing,
    bench_removals,
    bench_consolidation,
    bench_columnstore,
    bench_reader,
);

criterion_main!(benches);
