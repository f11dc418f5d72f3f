//! End-to-end pipeline scenarios.

use cascade_core::prelude::*;
use cascade_executor::builder::GraphBuilder;
use cascade_executor::scheduler::{ExecutorConfig, PipelineExecutor};
use cascade_executor::testing::{Probe, SequenceSource};
use std::sync::Arc;

fn cell_records(count: usize, fill: impl Fn(usize, &mut Products)) -> Vec<StorePtr> {
    let base = ProductStore::base();
    (0..count)
        .map(|i| {
            let mut bag = Products::new();
            fill(i, &mut bag);
            base.make_child(i, "cell", "gen", bag).unwrap()
        })
        .collect()
}

async fn run(
    source: SequenceSource,
    module: Module,
    persistence: Option<Arc<MemoryPersistence>>,
) -> Result<cascade_executor::scheduler::ExecutionSummary> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut builder = GraphBuilder::new(&source);
    builder.add_module(module)?;
    let graph = builder.build()?;
    let mut executor = PipelineExecutor::new(graph, ExecutorConfig::default());
    if let Some(backend) = persistence {
        executor = executor.with_persistence(backend);
    }
    executor.execute(Box::new(source)).await
}

#[tokio::test(flavor = "multi_thread")]
async fn plus_one_and_plus_101_reach_the_sink() {
    let records = cell_records(10, |i, bag| bag.add("a", i as i32).unwrap());
    let source = SequenceSource::new("gen")
        .providing::<i32>("a")
        .with_records(records);

    let probe: Probe<(i32, i32)> = Probe::new();
    let sink = probe.clone();

    let mut m = Module::new("demo");
    m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
        .input_family(["a"])
        .output_products("b");
    m.transform("plus_101", |a: i32| a + 101, Concurrency::Unlimited)
        .input_family(["a"])
        .output_products("c");
    m.observe(
        "sink",
        move |b: i32, c: i32| sink.record((b, c)),
        Concurrency::Unlimited,
    )
    .input_family(["b", "c"]);

    let summary = run(source, m, None).await.unwrap();
    assert_eq!(summary.records, 10);

    let expected: Vec<(i32, i32)> = (1..=10).map(|i| (i, i + 100)).collect();
    assert_eq!(probe.sorted(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_input_join_sums_to_one() {
    let records = cell_records(10, |i, bag| {
        bag.add("i", (i % 2) as i32).unwrap();
        bag.add("j", (1 - i % 2) as i32).unwrap();
    });
    let source = SequenceSource::new("gen")
        .providing::<i32>("i")
        .providing::<i32>("j")
        .with_records(records);

    let passes: Probe<i32> = Probe::new();
    let sink = passes.clone();

    let mut m = Module::new("demo");
    m.transform("add", |i: i32, j: i32| i + j, Concurrency::Unlimited)
        .input_family(["i", "j"])
        .output_products("sum");
    m.observe(
        "verify",
        move |sum: i32| {
            assert_eq!(sum, 1);
            sink.record(sum);
        },
        Concurrency::Unlimited,
    )
    .input_family(["sum"]);

    run(source, m, None).await.unwrap();
    assert_eq!(passes.len(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_level_inputs_join_on_the_ancestor_chain() {
    // Two producers at different levels feed one consumer: "piece" lives on
    // splitter-injected fragment records, "b" on their cell-level ancestors.
    // Each fragment must join with its own cell's "b".
    let records = cell_records(3, |i, bag| {
        bag.add("count", 2_u32).unwrap();
        bag.add("a", i as i32).unwrap();
    });
    let source = SequenceSource::new("gen")
        .providing::<u32>("count")
        .providing::<i32>("a")
        .with_records(records);

    let pairs: Probe<(u32, i32)> = Probe::new();
    let sink = pairs.clone();

    let mut m = Module::new("demo");
    m.split(
        "burst",
        |count: u32| (0..count).collect::<Vec<u32>>(),
        Concurrency::Serial,
    )
    .input_family(["count"])
    .into_level("fragment")
    .output_products("piece");
    m.transform("tag", |a: i32| a * 10, Concurrency::Unlimited)
        .input_family(["a"])
        .output_products("b");
    m.observe(
        "pair",
        move |piece: u32, b: i32| sink.record((piece, b)),
        Concurrency::Unlimited,
    )
    .input_family(["piece", "b"]);

    run(source, m, None).await.unwrap();

    let expected: Vec<(u32, i32)> = vec![
        (0, 0),
        (0, 10),
        (0, 20),
        (1, 0),
        (1, 10),
        (1, 20),
    ];
    assert_eq!(pairs.sorted(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn reduction_folds_each_run_to_six() {
    let base = ProductStore::base();
    let mut records = Vec::new();
    for r in 0..3 {
        let run = base.make_child(r, "run", "gen", Products::new()).unwrap();
        for e in 0..4 {
            let mut bag = Products::new();
            bag.add("n", e as i32).unwrap();
            records.push(run.make_child(e, "event", "gen", bag).unwrap());
        }
    }
    let source = SequenceSource::new("gen")
        .providing::<i32>("n")
        .with_records(records);

    let totals: Probe<i64> = Probe::new();
    let sink = totals.clone();

    let mut m = Module::new("demo");
    m.reduce(
        "sum_n",
        |acc: &mut i64, n: i32| *acc += i64::from(n),
        Concurrency::Serial,
    )
    .input_family(["n"])
    .over("run")
    .initialized_with(0_i64)
    .output_products("total");
    m.observe(
        "check_total",
        move |total: i64| sink.record(total),
        Concurrency::Unlimited,
    )
    .input_family(["total"]);

    let summary = run(source, m, None).await.unwrap();
    assert_eq!(summary.records, 12);
    assert_eq!(totals.sorted(), vec![6, 6, 6]);
}

#[tokio::test(flavor = "multi_thread")]
async fn user_failure_poisons_only_its_record() {
    let records = cell_records(10, |i, bag| bag.add("a", i as i32).unwrap());
    let source = SequenceSource::new("gen")
        .providing::<i32>("a")
        .with_records(records);

    let survivors: Probe<i32> = Probe::new();
    let sink = survivors.clone();

    let mut m = Module::new("demo");
    m.transform(
        "maybe_fail",
        |a: i32| {
            assert_ne!(a, 5, "refusing to process record five");
            a + 1
        },
        Concurrency::Unlimited,
    )
    .input_family(["a"])
    .output_products("b");
    m.observe(
        "sink",
        move |b: i32| sink.record(b),
        Concurrency::Unlimited,
    )
    .input_family(["b"]);

    let err = run(source, m, None).await.unwrap_err();
    match err {
        CascadeError::UserCallableFailed { node, record, .. } => {
            assert_eq!(node, "demo:maybe_fail");
            assert_eq!(record, "/cell:5");
        }
        other => panic!("expected UserCallableFailed, got {other}"),
    }
    assert_eq!(
        survivors.sorted(),
        vec![1, 2, 3, 4, 5, 7, 8, 9, 10]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn splitter_injects_a_child_level() {
    let records = cell_records(2, |_, bag| bag.add("count", 3_u32).unwrap());
    let source = SequenceSource::new("gen")
        .providing::<u32>("count")
        .with_records(records);

    let sums: Probe<u32> = Probe::new();
    let sink = sums.clone();

    let mut m = Module::new("demo");
    m.split(
        "burst",
        |count: u32| (0..count).collect::<Vec<u32>>(),
        Concurrency::Serial,
    )
    .input_family(["count"])
    .into_level("fragment")
    .output_products("piece");
    m.reduce(
        "sum_pieces",
        |acc: &mut u32, piece: u32| *acc += piece,
        Concurrency::Serial,
    )
    .input_family(["piece"])
    .over("cell")
    .initialized_with(0_u32)
    .output_products("piece_sum");
    m.observe(
        "check",
        move |piece_sum: u32| sink.record(piece_sum),
        Concurrency::Unlimited,
    )
    .input_family(["piece_sum"]);

    run(source, m, None).await.unwrap();
    // Each cell bursts into pieces 0, 1, 2.
    assert_eq!(sums.sorted(), vec![3, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn predicates_gate_records() {
    let records = cell_records(6, |i, bag| {
        bag.add("a", i as i32).unwrap();
        bag.add("keep", i % 2 == 0).unwrap();
    });
    let source = SequenceSource::new("gen")
        .providing::<i32>("a")
        .providing::<bool>("keep")
        .with_records(records);

    let kept: Probe<i32> = Probe::new();
    let sink = kept.clone();

    let mut m = Module::new("demo");
    m.observe(
        "gated",
        move |a: i32| sink.record(a),
        Concurrency::Unlimited,
    )
    .input_family(["a"])
    .when(["keep"]);

    run(source, m, None).await.unwrap();
    assert_eq!(kept.sorted(), vec![0, 2, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn outputs_commit_and_replay_round_trips() {
    let records = cell_records(4, |i, bag| bag.add("a", i as i32).unwrap());
    let source = SequenceSource::new("gen")
        .providing::<i32>("a")
        .with_records(records);

    let backend = MemoryPersistence::new();
    backend
        .configure_tech(&TechSettings {
            backend: "memory".to_string(),
            options: Default::default(),
        })
        .unwrap();
    backend
        .configure_output_items(&[OutputItem {
            label: "b".to_string(),
            layer: "job".to_string(),
        }])
        .unwrap();

    let mut m = Module::new("demo");
    m.transform("plus_one", |a: i32| a + 1, Concurrency::Unlimited)
        .input_family(["a"])
        .output_products("b");
    m.output("writer", Concurrency::Serial).input_family(["b"]);

    run(source, m, Some(Arc::clone(&backend))).await.unwrap();

    let committed = backend.committed_records("demo:writer");
    assert_eq!(committed.len(), 4);
    assert_eq!(
        backend.containers("demo:writer").unwrap().get("b").unwrap(),
        "i32"
    );

    // Replay the committed records through a fresh graph.
    let replay = ReplaySource::new(
        "replay",
        "demo:writer",
        backend as Arc<dyn Persistence>,
        vec![("b".to_string(), "i32".to_string())],
        committed,
    );

    let replayed: Probe<i32> = Probe::new();
    let sink = replayed.clone();
    let mut m = Module::new("demo");
    m.observe(
        "audit",
        move |b: i32| sink.record(b),
        Concurrency::Unlimited,
    )
    .input_family(["b"]);

    let mut builder = GraphBuilder::new(&replay);
    builder.add_module(m).unwrap();
    let graph = builder.build().unwrap();
    let executor = PipelineExecutor::new(graph, ExecutorConfig::default());
    executor.execute(Box::new(replay)).await.unwrap();

    assert_eq!(replayed.sorted(), vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn reduction_finalizer_maps_the_accumulator() {
    let base = ProductStore::base();
    let mut records = Vec::new();
    let run_level = base.make_child(0, "run", "gen", Products::new()).unwrap();
    for e in 0..5 {
        let mut bag = Products::new();
        bag.add("n", e as i32).unwrap();
        records.push(run_level.make_child(e, "event", "gen", bag).unwrap());
    }
    let source = SequenceSource::new("gen")
        .providing::<i32>("n")
        .with_records(records);

    let rates: Probe<String> = Probe::new();
    let sink = rates.clone();

    let mut m = Module::new("demo");
    m.reduce(
        "tally",
        |acc: &mut (i64, u64), n: i32| {
            acc.0 += i64::from(n);
            acc.1 += 1;
        },
        Concurrency::Serial,
    )
    .input_family(["n"])
    .over("run")
    .initialized_with((0_i64, 0_u64))
    .finalized_with(|(sum, count): (i64, u64)| format!("{sum}/{count}"))
    .output_products("tally_report");
    m.observe(
        "report",
        move |report: String| sink.record(report),
        Concurrency::Unlimited,
    )
    .input_family(["tally_report"]);

    run(source, m, None).await.unwrap();
    assert_eq!(rates.values(), vec!["10/5".to_string()]);
}
