use criterion::{Criterion, criterion_group, criterion_main};

use rtindex::analysis::{PlainDictionary, WhitespaceTokenizer};
use rtindex::search::sorter::{MatchSorter, SortKey};
use rtindex::{
    Accumulator, AttrDef, AttrType, AttrValue, DocId, Document, FieldDef, IndexLayout, QueryArgs,
    QueryNode, RtIndex, RtSettings, Schema, TermNode,
};

fn schema() -> Schema {
    Schema::new(
        vec![AttrDef::new("price", AttrType::Uint)],
        vec![FieldDef::new("title")],
    )
    .unwrap()
}

fn open_index(dir: &tempfile::TempDir) -> RtIndex {
    RtIndex::open(
        IndexLayout::new(dir.path().join("bench")),
        schema(),
        RtSettings::default(),
        Box::new(WhitespaceTokenizer),
        Box::new(PlainDictionary::default()),
        None,
    )
    .unwrap()
}

const TITLES: [&str; 4] = [
    "quick brown fox jumps over the lazy dog",
    "pack my box with five dozen liquor jugs",
    "how vexingly quick daft zebras jump",
    "sphinx of black quartz judge my vow",
];

fn bench_commit(c: &mut Criterion) {
    c.bench_function("commit_1000_docs", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let index = open_index(&dir);
                (dir, index)
            },
            |(_dir, index)| {
                let mut accum = Accumulator::new();
                for id in 1..=1000u64 {
                    let doc = Document::new(DocId(id))
                        .with_attr(AttrValue::Uint(id as u32))
                        .with_field(TITLES[id as usize % TITLES.len()]);
                    index.add_document(&mut accum, &doc, false).unwrap();
                }
                index.commit(&mut accum).unwrap();
            },
        );
    });
}

fn bench_query(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(&dir);
    let mut accum = Accumulator::new();
    for id in 1..=10_000u64 {
        let doc = Document::new(DocId(id))
            .with_attr(AttrValue::Uint(id as u32))
            .with_field(TITLES[id as usize % TITLES.len()]);
        index.add_document(&mut accum, &doc, false).unwrap();
    }
    index.commit(&mut accum).unwrap();
    index.force_disk_chunk().unwrap();

    let tree = QueryNode::Term(TermNode::new("quick"));
    c.bench_function("query_term_10k_docs", |b| {
        b.iter(|| {
            let mut sorters = vec![MatchSorter::new(20, SortKey::Score, vec![])];
            index
                .multi_query(&tree, &QueryArgs::default(), &mut sorters)
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_commit, bench_query);
criterion_main!(benches);
