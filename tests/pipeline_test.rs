// ABOUTME: Integration tests for the minutely pipeline against a scripted diff source
// ABOUTME: Covers resume, pacing, malformed diffs, filtering, CSV round-trips and ordering

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use osm_minutely::config::{Category, EmitConfig};
use osm_minutely::emitter::RowEmitter;
use osm_minutely::pipeline::{Pipeline, PipelineConfig, StartPosition};
use osm_minutely::replication::{DiffSource, FetchError, ReplicationState};
use osm_minutely::tracker::{FileStateStore, MemoryStateStore, Phase, SequenceState, StateStore};
use osm_minutely::utils::RetryPolicy;
use osm_minutely::{PipelineError, SequenceNumber};
use proptest::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const BASE_URL: &str = "https://replication.test/minute";

#[derive(Default)]
struct Script {
    responses: HashMap<u64, VecDeque<Result<Vec<u8>, FetchError>>>,
    calls: Vec<u64>,
    latest: Option<u64>,
}

/// Diff source answering from a per-sequence script; unscripted sequences are
/// not published yet.
#[derive(Clone, Default)]
struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    fn push(&self, sequence: u64, response: Result<Vec<u8>, FetchError>) {
        self.script
            .lock()
            .unwrap()
            .responses
            .entry(sequence)
            .or_default()
            .push_back(response);
    }

    fn calls(&self) -> Vec<u64> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl DiffSource for ScriptedSource {
    async fn fetch(&self, sequence: SequenceNumber) -> Result<Vec<u8>, FetchError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(sequence.get());
        script
            .responses
            .get_mut(&sequence.get())
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(FetchError::NotAvailable))
    }

    async fn latest(&self) -> Result<ReplicationState, FetchError> {
        match self.script.lock().unwrap().latest {
            Some(sequence) => Ok(ReplicationState {
                sequence: SequenceNumber::new(sequence),
                timestamp: None,
            }),
            None => Err(FetchError::Transient("no state.txt".into())),
        }
    }
}

struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"))
    }
}

/// Output whose reader has stopped draining it.
struct StalledWriter;

impl Write for StalledWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_secs(2));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Send shutdown once the pipeline starts polling for `sequence`.
fn stop_when_polled(source: &ScriptedSource, sequence: u64, tx: broadcast::Sender<()>) -> JoinHandle<()> {
    let source = source.clone();
    tokio::spawn(async move {
        while !source.calls().contains(&sequence) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let _ = tx.send(());
    })
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\n', "&#10;")
}

fn tags_xml(tags: &[(&str, &str)]) -> String {
    tags.iter()
        .map(|(k, v)| format!(r#"<tag k="{}" v="{}"/>"#, xml_escape(k), xml_escape(v)))
        .collect()
}

fn node_diff(id: u64, tags: &[(&str, &str)]) -> Vec<u8> {
    gzip(&format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="test">
  <create>
    <node id="{id}" version="1" timestamp="2025-03-03T11:55:24Z" uid="42" user="mapper" changeset="{id}" lat="1.0" lon="2.0">{tags}</node>
  </create>
</osmChange>"#,
        id = id,
        tags = tags_xml(tags)
    ))
}

fn mixed_diff() -> Vec<u8> {
    gzip(
        r#"<osmChange version="0.6">
  <create>
    <node id="1" version="1" timestamp="2025-03-03T11:55:24Z" lat="1.0" lon="2.0"><tag k="amenity" v="cafe"/></node>
    <way id="2" version="1" timestamp="2025-03-03T11:55:24Z"><nd ref="1"/><nd ref="3"/><tag k="highway" v="path"/></way>
  </create>
  <modify>
    <relation id="3" version="2" timestamp="2025-03-03T11:55:24Z"><member type="way" ref="2" role="outer"/><tag k="type" v="route"/></relation>
  </modify>
  <delete>
    <node id="4" version="5" timestamp="2025-03-03T11:55:24Z"/>
  </delete>
</osmChange>"#,
    )
}

fn gzip(xml: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        base_url: BASE_URL.to_string(),
        poll_interval: Duration::from_millis(1),
        retry_interval: Duration::from_millis(1),
        alert_threshold: 2,
        retry: RetryPolicy::immediate(0),
        changeset_marker: None,
    }
}

async fn open_pipeline(
    source: ScriptedSource,
    emit: EmitConfig,
    first: u64,
) -> Pipeline<ScriptedSource, MemoryStateStore, Vec<u8>> {
    Pipeline::open(
        test_config(),
        source,
        MemoryStateStore::new(),
        RowEmitter::new(Vec::new(), emit),
        StartPosition::At(SequenceNumber::new(first)),
    )
    .await
    .unwrap()
}

fn output_of<S: DiffSource, St: StateStore>(pipeline: Pipeline<S, St, Vec<u8>>) -> String {
    let (_, _, emitter, _) = pipeline.into_parts();
    String::from_utf8(emitter.into_inner().unwrap()).unwrap()
}

fn parse_rows(output: &str) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(output.as_bytes())
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .filter(|row: &Vec<String>| row[0] != "kind")
        .collect()
}

#[tokio::test]
async fn single_node_create_emits_node_and_tag_rows() {
    let source = ScriptedSource::default();
    source.push(100, Ok(node_diff(1, &[("k", "v")])));

    let emit = EmitConfig::new(&[Category::Nodes, Category::Tags]);
    let mut pipeline = open_pipeline(source, emit, 100).await;

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.sequence, SequenceNumber::new(100));
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(100));
    assert_eq!(pipeline.store().history(), vec![SequenceNumber::new(100)]);

    let rows = parse_rows(&output_of(pipeline));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], "node");
    assert_eq!(rows[0][3], "1");
    assert_eq!(rows[0][8].parse::<f64>().unwrap(), 1.0);
    assert_eq!(rows[0][9].parse::<f64>().unwrap(), 2.0);
    assert_eq!(rows[1], vec!["tag", "1741002924000", "node", "1", "k", "v"]);
    assert!(!rows.iter().any(|row| row[0] == "way" || row[0] == "relation"));
}

#[tokio::test]
async fn not_available_three_times_then_success() {
    let source = ScriptedSource::default();
    for _ in 0..3 {
        source.push(50, Err(FetchError::NotAvailable));
    }
    source.push(50, Ok(node_diff(7, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 50).await;

    for _ in 0..3 {
        let err = pipeline.run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::NotAvailable { .. }));
        assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(49));
        assert!(pipeline.store().history().is_empty());
    }

    pipeline.run_cycle().await.unwrap();
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(50));
    assert_eq!(pipeline.store().history(), vec![SequenceNumber::new(50)]);
    assert_eq!(source.calls(), vec![50, 50, 50, 50]);
}

#[tokio::test]
async fn malformed_diff_is_retried_without_advancing() {
    let source = ScriptedSource::default();
    source.push(10, Ok(b"<osmChange><create><node id=\"1\"".to_vec()));
    source.push(10, Ok(gzip("<osm version=\"0.6\"></osm>")));
    source.push(10, Ok(node_diff(3, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 10).await;

    for _ in 0..2 {
        let err = pipeline.run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedDiff { .. }), "{:?}", err);
        assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(9));
        assert_eq!(pipeline.tracker().next_sequence(), Some(SequenceNumber::new(10)));
    }
    assert!(pipeline.store().history().is_empty());

    pipeline.run_cycle().await.unwrap();
    assert_eq!(source.calls(), vec![10, 10, 10]);

    // Only the successful attempt produced rows
    let rows = parse_rows(&output_of(pipeline));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][3], "3");
}

#[tokio::test]
async fn transient_errors_surface_after_bounded_retries() {
    let source = ScriptedSource::default();
    for _ in 0..3 {
        source.push(5, Err(FetchError::Transient("HTTP 503".into())));
    }
    source.push(5, Ok(node_diff(1, &[])));

    let mut config = test_config();
    config.retry = RetryPolicy::immediate(1);
    let mut pipeline = Pipeline::open(
        config,
        source.clone(),
        MemoryStateStore::new(),
        RowEmitter::new(Vec::new(), EmitConfig::all()),
        StartPosition::At(SequenceNumber::new(5)),
    )
    .await
    .unwrap();

    // Two attempts per cycle: first cycle exhausts its retries
    let err = pipeline.run_cycle().await.unwrap_err();
    assert!(matches!(err, PipelineError::TransientFetch { .. }));
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(4));

    // Second cycle: one more failure, then the retry succeeds
    pipeline.run_cycle().await.unwrap();
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(5));
    assert_eq!(source.calls().len(), 4);
}

#[tokio::test]
async fn category_filter_nodes_only() {
    let source = ScriptedSource::default();
    source.push(1, Ok(mixed_diff()));

    let mut pipeline = open_pipeline(source, EmitConfig::new(&[Category::Nodes]), 1).await;
    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.stats.records, 4);
    assert_eq!(report.stats.nodes, 2);
    assert_eq!(report.stats.rows(), 2);

    let rows = parse_rows(&output_of(pipeline));
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row[0] == "node"));
    assert_eq!(rows[1][1], "delete");
    assert_eq!(rows[1][8], "");
}

#[tokio::test]
async fn rows_follow_decode_order() {
    let source = ScriptedSource::default();
    source.push(1, Ok(mixed_diff()));

    let mut pipeline = open_pipeline(source, EmitConfig::all(), 1).await;
    pipeline.run_cycle().await.unwrap();

    let kinds: Vec<String> = parse_rows(&output_of(pipeline))
        .into_iter()
        .map(|row| match row[0].as_str() {
            "member" => format!("member:{}", row[1]),
            kind => format!("{}:{}", kind, row[3]),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "node:1",
            "tag:1",
            "way:2",
            "tag:2",
            "relation:3",
            "member:3",
            "tag:3",
            "node:4"
        ]
    );
}

#[tokio::test]
async fn reprocessing_a_diff_is_byte_identical() {
    let payload = node_diff(9, &[("name", "Café, \"Le\" Bistro"), ("amenity", "cafe")]);
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let source = ScriptedSource::default();
        source.push(77, Ok(payload.clone()));
        let mut pipeline = open_pipeline(source, EmitConfig::all(), 77).await;
        pipeline.run_cycle().await.unwrap();
        outputs.push(output_of(pipeline));
    }
    assert!(!outputs[0].is_empty());
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn csv_round_trip_preserves_awkward_values() {
    let awkward = [
        ("name", "Smith, Jones & Co"),
        ("note", "say \"hello\""),
        ("description", "line one\nline two"),
    ];
    let source = ScriptedSource::default();
    source.push(3, Ok(node_diff(12, &awkward)));

    let mut pipeline = open_pipeline(source, EmitConfig::new(&[Category::Tags]), 3).await;
    pipeline.run_cycle().await.unwrap();

    let rows = parse_rows(&output_of(pipeline));
    let parsed: HashMap<String, String> = rows
        .iter()
        .map(|row| (row[4].clone(), row[5].clone()))
        .collect();
    assert_eq!(parsed.len(), 3);
    for (key, value) in awkward {
        assert_eq!(parsed[key], value);
    }
    assert!(rows.iter().all(|row| row[3] == "12" && row[2] == "node"));
}

#[tokio::test]
async fn output_write_failure_is_fatal_and_does_not_advance() {
    let source = ScriptedSource::default();
    source.push(20, Ok(node_diff(1, &[])));

    let mut pipeline = Pipeline::open(
        test_config(),
        source,
        MemoryStateStore::new(),
        RowEmitter::new(FailingWriter, EmitConfig::all()),
        StartPosition::At(SequenceNumber::new(20)),
    )
    .await
    .unwrap();

    let (_tx, rx) = broadcast::channel::<()>(1);
    let err = pipeline.run(rx, false).await.unwrap_err();
    assert!(matches!(err, PipelineError::OutputWrite(_)));
    assert!(err.is_fatal());
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(19));
    assert!(pipeline.store().history().is_empty());
}

#[tokio::test]
async fn run_once_processes_a_single_sequence() {
    let source = ScriptedSource::default();
    source.push(100, Ok(node_diff(1, &[])));
    source.push(101, Ok(node_diff(2, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 100).await;
    let (_tx, rx) = broadcast::channel::<()>(1);
    let summary = pipeline.run(rx, true).await.unwrap();

    assert_eq!(summary.advanced, 1);
    assert_eq!(summary.last_processed, Some(SequenceNumber::new(100)));
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(100));
    assert_eq!(source.calls(), vec![100]);
}

#[tokio::test]
async fn run_once_exits_quietly_when_nothing_is_published() {
    let source = ScriptedSource::default();
    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 100).await;
    let (_tx, rx) = broadcast::channel::<()>(1);

    let summary = pipeline.run(rx, true).await.unwrap();
    assert_eq!(summary.advanced, 0);
    assert_eq!(summary.last_processed, None);
    assert_eq!(source.calls(), vec![100]);
}

#[tokio::test]
async fn run_once_reports_failures() {
    let source = ScriptedSource::default();
    source.push(100, Ok(b"<osm/>".to_vec()));
    let mut pipeline = open_pipeline(source, EmitConfig::all(), 100).await;
    let (_tx, rx) = broadcast::channel::<()>(1);

    let err = pipeline.run(rx, true).await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedDiff { .. }));
    assert!(pipeline.store().history().is_empty());
}

#[tokio::test]
async fn run_continues_past_failures_until_shutdown() {
    let source = ScriptedSource::default();
    source.push(1, Err(FetchError::Transient("reset".into())));
    source.push(1, Ok(node_diff(1, &[])));
    source.push(2, Ok(b"garbage".to_vec()));
    source.push(2, Ok(node_diff(2, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 1).await;
    let (tx, rx) = broadcast::channel::<()>(1);
    // Sequence 3 is never published
    let watcher = stop_when_polled(&source, 3, tx);

    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run(rx, false))
        .await
        .expect("pipeline did not stop")
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(summary.advanced, 2);
    assert_eq!(summary.failures, 2);
    // One failure per sequence stays below alert_threshold = 2
    assert_eq!(summary.alerts, 0);
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(2));
    assert_eq!(
        pipeline.store().history(),
        vec![SequenceNumber::new(1), SequenceNumber::new(2)]
    );
}

#[tokio::test]
async fn repeated_failures_on_one_sequence_escalate() {
    let source = ScriptedSource::default();
    for _ in 0..3 {
        source.push(1, Ok(b"<osmChange><create>".to_vec()));
    }
    source.push(1, Ok(node_diff(1, &[])));
    source.push(2, Err(FetchError::Transient("reset".into())));
    source.push(2, Ok(node_diff(2, &[])));
    source.push(3, Err(FetchError::Transient("reset".into())));
    source.push(3, Err(FetchError::Transient("reset".into())));
    source.push(3, Ok(node_diff(3, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 1).await;
    let (tx, rx) = broadcast::channel::<()>(1);
    let watcher = stop_when_polled(&source, 4, tx);

    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run(rx, false))
        .await
        .expect("pipeline did not stop")
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(summary.advanced, 3);
    assert_eq!(summary.failures, 6);
    // Sequence 1: attempts 2 and 3 reach the threshold. Sequence 2 starts a
    // fresh count and stays below it. Sequence 3 reaches it on attempt 2.
    assert_eq!(summary.alerts, 3);
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(3));
}

#[tokio::test]
async fn shutdown_interrupts_a_stalled_output_write() {
    let source = ScriptedSource::default();
    source.push(1, Ok(node_diff(1, &[("k", "v")])));

    let mut pipeline = Pipeline::open(
        test_config(),
        source,
        MemoryStateStore::new(),
        RowEmitter::new(StalledWriter, EmitConfig::all()),
        StartPosition::At(SequenceNumber::new(1)),
    )
    .await
    .unwrap();

    let (tx, rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(());
    });

    let started = Instant::now();
    let summary = tokio::time::timeout(Duration::from_secs(1), pipeline.run(rx, false))
        .await
        .expect("shutdown did not interrupt the output write")
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.advanced, 0);
    assert_eq!(pipeline.tracker().phase(), Phase::Idle);
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(0));
    assert!(pipeline.store().history().is_empty());
}

#[tokio::test]
async fn shutdown_before_start_processes_nothing() {
    let source = ScriptedSource::default();
    source.push(1, Ok(node_diff(1, &[])));

    let mut pipeline = open_pipeline(source.clone(), EmitConfig::all(), 1).await;
    let (tx, rx) = broadcast::channel::<()>(1);
    tx.send(()).unwrap();

    let summary = pipeline.run(rx, false).await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert!(source.calls().is_empty());
    assert_eq!(pipeline.tracker().low_water_mark(), SequenceNumber::new(0));
}

#[tokio::test]
async fn resumes_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let store = FileStateStore::new(&state_path);
    store
        .save(&SequenceState::new(BASE_URL, SequenceNumber::new(300)))
        .await
        .unwrap();

    let source = ScriptedSource::default();
    source.push(301, Ok(node_diff(1, &[])));

    let mut pipeline = Pipeline::open(
        test_config(),
        source.clone(),
        FileStateStore::new(&state_path),
        RowEmitter::new(Vec::new(), EmitConfig::all()),
        StartPosition::At(SequenceNumber::new(5)),
    )
    .await
    .unwrap();
    assert_eq!(pipeline.tracker().next_sequence(), Some(SequenceNumber::new(301)));

    pipeline.run_cycle().await.unwrap();
    let reloaded = FileStateStore::new(&state_path).load().await.unwrap().unwrap();
    assert_eq!(reloaded.last_processed, SequenceNumber::new(301));
    assert_eq!(reloaded.max_changeset, Some(1));
}

#[tokio::test]
async fn starts_at_upstream_latest_without_state() {
    let source = ScriptedSource::default();
    source.script.lock().unwrap().latest = Some(6_000_000);

    let pipeline = Pipeline::open(
        test_config(),
        source,
        MemoryStateStore::new(),
        RowEmitter::new(Vec::new(), EmitConfig::all()),
        StartPosition::Latest,
    )
    .await
    .unwrap();
    assert_eq!(
        pipeline.tracker().next_sequence(),
        Some(SequenceNumber::new(6_000_000))
    );
}

#[tokio::test]
async fn refuses_state_from_another_stream() {
    let store =
        MemoryStateStore::with_state(SequenceState::new("https://other.test/hour", SequenceNumber::new(3)));
    let result = Pipeline::open(
        test_config(),
        ScriptedSource::default(),
        store,
        RowEmitter::new(Vec::new(), EmitConfig::all()),
        StartPosition::Latest,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn changeset_marker_is_written_after_advance() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("changeset.txt");

    let source = ScriptedSource::default();
    source.push(1, Ok(node_diff(4242, &[])));

    let mut config = test_config();
    config.changeset_marker = Some(marker.clone());
    let mut pipeline = Pipeline::open(
        config,
        source,
        MemoryStateStore::new(),
        RowEmitter::new(Vec::new(), EmitConfig::default()),
        StartPosition::At(SequenceNumber::new(1)),
    )
    .await
    .unwrap();

    pipeline.run_cycle().await.unwrap();
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "4242");
}

#[derive(Debug, Clone, Copy)]
enum Injected {
    Publish,
    NotYet,
    NetworkDown,
    Corrupt,
}

fn injected() -> impl Strategy<Value = Injected> {
    prop_oneof![
        3 => Just(Injected::Publish),
        1 => Just(Injected::NotYet),
        1 => Just(Injected::NetworkDown),
        1 => Just(Injected::Corrupt),
    ]
}

/// Source that answers every fetch from a global schedule, whatever the sequence.
#[derive(Clone)]
struct ScheduledSource {
    schedule: Arc<Mutex<VecDeque<Injected>>>,
}

#[async_trait]
impl DiffSource for ScheduledSource {
    async fn fetch(&self, sequence: SequenceNumber) -> Result<Vec<u8>, FetchError> {
        let next = self.schedule.lock().unwrap().pop_front();
        match next {
            Some(Injected::Publish) => Ok(node_diff(sequence.get(), &[])),
            Some(Injected::NotYet) | None => Err(FetchError::NotAvailable),
            Some(Injected::NetworkDown) => Err(FetchError::Transient("injected".into())),
            Some(Injected::Corrupt) => Ok(b"<osmChange><create>".to_vec()),
        }
    }

    async fn latest(&self) -> Result<ReplicationState, FetchError> {
        Err(FetchError::NotAvailable)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_advances_are_gap_free(
        start in 1u64..1_000_000,
        schedule in proptest::collection::vec(injected(), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let published = schedule.iter().filter(|e| matches!(e, Injected::Publish)).count() as u64;
        let cycles = schedule.len();
        let source = ScheduledSource {
            schedule: Arc::new(Mutex::new(schedule.into_iter().collect())),
        };

        let (history, rows) = runtime.block_on(async move {
            let mut pipeline = Pipeline::open(
                test_config(),
                source,
                MemoryStateStore::new(),
                RowEmitter::new(Vec::new(), EmitConfig::new(&[Category::Nodes])),
                StartPosition::At(SequenceNumber::new(start)),
            )
            .await
            .unwrap();

            for _ in 0..cycles {
                let before = pipeline.tracker().low_water_mark();
                match pipeline.run_cycle().await {
                    Ok(report) => assert_eq!(Some(report.sequence), before.next()),
                    Err(e) => {
                        assert!(!e.is_fatal());
                        assert_eq!(pipeline.tracker().low_water_mark(), before);
                    }
                }
            }
            let history = pipeline.store().history();
            (history, parse_rows(&output_of(pipeline)))
        });

        prop_assert_eq!(history.len() as u64, published);
        for (offset, sequence) in history.iter().enumerate() {
            prop_assert_eq!(sequence.get(), start + offset as u64);
        }
        // One node row per advanced sequence, in order, none for failed attempts
        let ids: Vec<u64> = rows.iter().map(|row| row[3].parse().unwrap()).collect();
        let expected: Vec<u64> = history.iter().map(|s| s.get()).collect();
        prop_assert_eq!(ids, expected);
    }
}
