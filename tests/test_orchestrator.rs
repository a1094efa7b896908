use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use assert_matches::assert_matches;
use camino::Utf8PathBuf as PathBuf;
use tempfile::TempDir;

use plast_runner::engine::local::LocalEngine;
use plast_runner::engine::{
    keys, Engine, EngineProperties, HitResult, HspResult, ListenerId, ListenerRegistry,
    QueryResult, Request, RequestListener, ResultBatch,
};
use plast_runner::writer::{ReportFormat, WriterOptions};
use plast_runner::{
    run_job, AggregatorError, JobConfig, PlastError, ReportAggregator, ResultAggregator,
};

#[derive(Clone)]
enum Step {
    Started,
    Progress(f64),
    Batch(ResultBatch),
    Finished,
    Cancelled,
    Fail(&'static str),
    /// Block until the request is cancelled, then fire `cancelled`.
    WaitForCancel,
    /// Sleep without looking at cancellation.
    Stall(Duration),
}

struct ScriptedEngine {
    script: Vec<Step>,
    requests: AtomicUsize,
    last_request: std::sync::Mutex<Option<Arc<ScriptedRequest>>>,
}

impl ScriptedEngine {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            requests: AtomicUsize::new(0),
            last_request: std::sync::Mutex::new(None),
        }
    }

    fn listeners_left(&self) -> usize {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.listeners.len())
            .unwrap_or(0)
    }
}

struct ScriptedRequest {
    props: EngineProperties,
    script: Vec<Step>,
    listeners: ListenerRegistry,
    cancelled: AtomicBool,
}

impl Engine for ScriptedEngine {
    fn create_request(&self, props: EngineProperties) -> Result<Arc<dyn Request>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let request = Arc::new(ScriptedRequest {
            props,
            script: self.script.clone(),
            listeners: ListenerRegistry::default(),
            cancelled: AtomicBool::new(false),
        });
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(request)
    }
}

impl Request for ScriptedRequest {
    fn properties(&self) -> &EngineProperties {
        &self.props
    }

    fn add_listener(&self, listener: Arc<dyn RequestListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id)
    }

    fn execute(&self) -> Result<()> {
        for step in &self.script {
            match step {
                Step::Started => self.listeners.notify(|l| l.started()),
                Step::Progress(p) => self.listeners.notify(|l| l.progress(*p)),
                Step::Batch(batch) => self.listeners.notify(|l| l.result_available(batch.clone())),
                Step::Finished => self.listeners.notify(|l| l.finished()),
                Step::Cancelled => self.listeners.notify(|l| l.cancelled()),
                Step::Fail(msg) => bail!("{}", msg),
                Step::WaitForCancel => {
                    while !self.cancelled.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    self.listeners.notify(|l| l.cancelled());
                }
                Step::Stall(pause) => std::thread::sleep(*pause),
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn hsp() -> HspResult {
    HspResult {
        evalue: 1e-20,
        score: 200.0,
        bit_score: 81.3,
        identity: 40,
        positive: 45,
        gaps: 0,
        align_len: 50,
        query_from: 1,
        query_to: 50,
        query_frame: 1,
        query_len: 60,
        subject_from: 11,
        subject_to: 60,
        subject_frame: 1,
        subject_len: 100,
        query_seq: None,
        subject_seq: None,
        midline: None,
    }
}

fn query(id: &str, hsps_per_hit: &[usize]) -> QueryResult {
    QueryResult {
        id: id.to_string(),
        definition: String::new(),
        length: 60,
        hits: hsps_per_hit
            .iter()
            .enumerate()
            .map(|(i, n)| HitResult {
                id: format!("subject{}", i + 1),
                definition: String::new(),
                length: 100,
                hsps: vec![hsp(); *n],
            })
            .collect(),
    }
}

struct Workspace {
    dir: TempDir,
    query: PathBuf,
    subject: PathBuf,
    output: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let query = root.join("query.fa");
        let subject = root.join("subject.fa");
        std::fs::write(&query, ">q1\nMKV\n").unwrap();
        std::fs::write(&subject, ">s1\nMKV\n").unwrap();
        Self {
            output: root.join("out.xml"),
            dir,
            query,
            subject,
        }
    }

    fn config(&self) -> JobConfig {
        JobConfig::new("plastp", self.query.clone(), self.subject.clone(), self.output.clone())
            .working_dir(self.root())
    }

    fn root(&self) -> PathBuf {
        PathBuf::from_path_buf(self.dir.path().to_path_buf()).unwrap()
    }

    fn leftover_temp_files(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("plast") && name.ends_with(".tmp")
            })
            .count()
    }
}

fn plast_error(err: &anyhow::Error) -> &PlastError {
    err.downcast_ref::<PlastError>()
        .unwrap_or_else(|| panic!("not a PlastError: {:#}", err))
}

#[test]
fn test_two_batches_out_of_order() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Progress(0.5),
        Step::Batch(ResultBatch::new(vec![query("B", &[1, 1, 1])])),
        Step::Progress(1.0),
        Step::Batch(ResultBatch::new(vec![query("A", &[2])])),
        Step::Finished,
    ]);

    let report = run_job(&engine, &ws.config()).unwrap();
    assert_eq!(report.stats.queries, 2);
    assert_eq!(report.stats.hits, 4);
    assert_eq!(report.stats.hsps, 5);
    assert_eq!(report.progress, 1.0);

    let ids: Vec<&str> = report
        .output
        .iterations()
        .iter()
        .map(|i| i.query_id.as_str())
        .collect();
    assert_eq!(ids, vec!["B", "A"]);

    let xml = std::fs::read_to_string(&ws.output).unwrap();
    assert!(xml.contains("<Iteration_query-ID>B</Iteration_query-ID>"));
    assert_eq!(xml.matches("<Hsp>").count(), 5);
    assert_eq!(engine.listeners_left(), 0, "listener still registered");
    assert_eq!(ws.leftover_temp_files(), 0, "temporary file not removed");
}

#[test]
fn test_engine_receives_job_properties() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![Step::Started, Step::Finished]);
    let config = ws.config().cores(2).max_hsps(3).seeds(0.5);
    run_job(&engine, &config).unwrap();

    let guard = engine.last_request.lock().unwrap();
    let props = guard.as_ref().unwrap().properties();
    assert_eq!(props.get(keys::ALGO_TYPE), Some("plastp"));
    assert_eq!(props.get(keys::QUERY_URI), Some(ws.query.as_str()));
    assert_eq!(props.get(keys::NB_PROCESSORS), Some("2"));
    assert_eq!(props.get(keys::MAX_HSP_PER_HIT), Some("3"));
    assert_eq!(props.get(keys::SEEDS_USE_RATIO), Some("0.5"));
    assert_eq!(props.get(keys::FORCE_QUERY_ORDERING), Some("1000"));
    let tmp = props.get(keys::OUTPUT_URI).unwrap();
    assert!(tmp.ends_with(".tmp"), "unexpected engine output {}", tmp);
    assert!(!std::path::Path::new(tmp).exists());
}

#[test]
fn test_no_query_writes_empty_report() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![Step::Started, Step::Finished]);

    let report = run_job(&engine, &ws.config()).unwrap();
    assert!(report.output.iterations().is_empty());
    assert_eq!(report.stats.queries, 0);

    let xml = std::fs::read_to_string(&ws.output).unwrap();
    assert!(xml.contains("<BlastOutput_db>subject.fa</BlastOutput_db>"));
    assert!(!xml.contains("<Iteration>"));
}

#[test]
fn test_engine_failure_writes_nothing() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Batch(ResultBatch::new(vec![query("q1", &[1])])),
        Step::Fail("bank is corrupted"),
    ]);

    let err = run_job(&engine, &ws.config()).unwrap_err();
    assert_matches!(plast_error(&err), PlastError::Engine(msg) if msg.contains("bank is corrupted"));
    assert!(!ws.output.exists(), "report written for a failed job");
    assert_eq!(engine.listeners_left(), 0);
    assert_eq!(ws.leftover_temp_files(), 0);
}

#[test]
fn test_cancelled_job_fails() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Batch(ResultBatch::new(vec![query("q1", &[1])])),
        Step::Cancelled,
    ]);

    let err = run_job(&engine, &ws.config()).unwrap_err();
    assert_matches!(plast_error(&err), PlastError::Cancelled);
    assert!(!ws.output.exists());
}

#[test]
fn test_events_after_cancel_are_an_internal_error() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Cancelled,
        Step::Batch(ResultBatch::new(vec![query("q1", &[1])])),
        Step::Finished,
    ]);

    let err = run_job(&engine, &ws.config()).unwrap_err();
    assert_matches!(
        plast_error(&err),
        PlastError::Aggregator(AggregatorError::AlreadyTerminated { .. })
    );
}

#[test]
fn test_double_start_is_an_internal_error() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![Step::Started, Step::Started, Step::Finished]);

    let err = run_job(&engine, &ws.config()).unwrap_err();
    assert_matches!(
        plast_error(&err),
        PlastError::Aggregator(AggregatorError::AlreadyStarted { .. })
    );
    assert!(!ws.output.exists());
}

#[test]
fn test_timeout_cancels_request() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Batch(ResultBatch::new(vec![query("q1", &[1])])),
        Step::WaitForCancel,
    ]);
    let config = ws.config().timeout(Duration::from_millis(100));

    let err = run_job(&engine, &config).unwrap_err();
    assert_matches!(plast_error(&err), PlastError::Cancelled);
    assert_eq!(engine.listeners_left(), 0);
    assert_eq!(ws.leftover_temp_files(), 0);
}

#[test]
fn test_timeout_does_not_wait_for_stalled_engine() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Stall(Duration::from_secs(10)),
        Step::Finished,
    ]);
    let config = ws
        .config()
        .timeout(Duration::from_millis(100))
        .cancel_grace(Duration::from_millis(200));

    let start = Instant::now();
    let err = run_job(&engine, &config).unwrap_err();
    let elapsed = start.elapsed();

    assert_matches!(plast_error(&err), PlastError::Cancelled);
    assert!(elapsed < Duration::from_secs(2), "waited {:?}", elapsed);
    assert!(!ws.output.exists());
    assert_eq!(engine.listeners_left(), 0);
    assert_eq!(ws.leftover_temp_files(), 0);
}

#[test]
fn test_unusable_working_dir_is_an_io_error() {
    let ws = Workspace::new();
    let config = ws.config().working_dir(ws.root().join("no/such/dir"));
    let engine = ScriptedEngine::new(vec![Step::Started, Step::Finished]);

    let err = run_job(&engine, &config).unwrap_err();
    assert_matches!(plast_error(&err), PlastError::Io(_));
    assert_eq!(engine.requests.load(Ordering::SeqCst), 0);
    assert!(!ws.output.exists());
}

#[test]
fn test_missing_subject_is_rejected_before_submission() {
    let ws = Workspace::new();
    let config = JobConfig::new(
        "plastp",
        ws.query.clone(),
        ws.root().join("missing.fa"),
        ws.output.clone(),
    );
    let engine = ScriptedEngine::new(vec![Step::Started, Step::Finished]);

    let err = run_job(&engine, &config).unwrap_err();
    assert_matches!(plast_error(&err), PlastError::Config(_));
    assert_eq!(engine.requests.load(Ordering::SeqCst), 0);
}

#[test]
fn test_tabular_report() {
    let ws = Workspace::new();
    let engine = ScriptedEngine::new(vec![
        Step::Started,
        Step::Batch(ResultBatch::new(vec![query("q1", &[2, 1]), query("q2", &[])])),
        Step::Finished,
    ]);
    let config = ws.config().format(ReportFormat::Tabular).writer_options(WriterOptions {
        first_hsp_only: true,
        ..Default::default()
    });

    run_job(&engine, &config).unwrap();
    let content = std::fs::read_to_string(&ws.output).unwrap();
    let rows: Vec<&str> = content.lines().collect();
    assert_eq!(rows.len(), 2, "first hsp of each hit: {:?}", rows);
    assert!(rows[0].starts_with("q1\tsubject1\t80.00\t50\t"));
}

#[test]
fn test_local_engine_end_to_end() {
    let ws = Workspace::new();
    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/test-data");
    let config = JobConfig::new(
        "plastp",
        data.join("query.fa"),
        data.join("subject.fa"),
        ws.output.clone(),
    )
    .cores(2)
    .evalue(1e-5)
    .filter(false)
    .working_dir(ws.root());

    let report = run_job(&LocalEngine::with_slice_size(1), &config).unwrap();
    let ids: Vec<&str> = report
        .output
        .iterations()
        .iter()
        .map(|i| i.query_id.as_str())
        .collect();
    assert_eq!(ids, vec!["q1", "q2", "q3"], "queries reported out of input order");

    let q1 = &report.output.iterations()[0];
    assert_eq!(q1.hits()[0].id, "s1");
    let q3 = &report.output.iterations()[2];
    assert_eq!(q3.hits()[0].id, "s2");
    assert_eq!(q3.hits()[0].hsps()[0].score.identity, 105);
    assert!(report.output.iterations()[1].hits().is_empty());
    assert_eq!(report.stats.matching_queries, 2);
    assert_eq!(
        report.output.params().matrix.as_deref(),
        Some("BLOSUM62"),
        "scoring parameters not reported"
    );
}

/// Deterministic pseudo-random protein bank.
fn write_protein_bank(path: &camino::Utf8Path, prefix: &str, count: usize, len: usize, seed: u64) {
    const RESIDUES: &[u8] = b"ACDEFGHIKLMNPQRSTVWY";
    let mut state = seed;
    let mut content = String::new();
    for n in 0..count {
        content.push_str(&format!(">{}{}\n", prefix, n));
        for _ in 0..len {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            content.push(RESIDUES[(state >> 33) as usize % RESIDUES.len()] as char);
        }
        content.push('\n');
    }
    std::fs::write(path, content).unwrap();
}

#[test]
fn test_local_engine_stops_inside_a_slice_on_timeout() {
    let ws = Workspace::new();
    let query = ws.root().join("big_query.fa");
    let subject = ws.root().join("big_subject.fa");
    write_protein_bank(&query, "q", 100, 300, 1);
    write_protein_bank(&subject, "s", 100, 300, 2);

    let config = JobConfig::new("plastp", query, subject, ws.output.clone())
        .cores(1)
        .filter(false)
        .timeout(Duration::from_millis(200))
        .cancel_grace(Duration::from_secs(60))
        .working_dir(ws.root());

    // every query lands in the one slice
    let start = Instant::now();
    let err = run_job(&LocalEngine::with_slice_size(1000), &config).unwrap_err();
    let elapsed = start.elapsed();

    assert_matches!(plast_error(&err), PlastError::Cancelled);
    assert!(
        elapsed < Duration::from_secs(5),
        "engine kept searching after cancel: {:?}",
        elapsed
    );
    assert!(!ws.output.exists());
}

#[test]
fn test_local_engine_unordered_delivery() {
    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/test-data");
    let subject = data.join("subject.fa");
    let mut props = EngineProperties::new();
    props
        .set(keys::ALGO_TYPE, "plastp")
        .set(keys::QUERY_URI, data.join("query.fa").as_str())
        .set(keys::SUBJECT_URI, subject.as_str())
        .set(keys::NB_PROCESSORS, "3")
        .set(keys::FILTER_QUERY, "F");

    let request = LocalEngine::with_slice_size(1)
        .create_request(props)
        .unwrap();
    assert_eq!(request.properties().get(keys::FORCE_QUERY_ORDERING), None);

    let aggregator = ReportAggregator::new("plastp", &subject, request.properties().clone());
    let listener = Arc::new(ResultAggregator::spawn(aggregator));
    let id = request.add_listener(listener.clone());
    request.execute().unwrap();
    request.remove_listener(id);

    let collected = listener.detach().unwrap();
    assert!(collected.error.is_none());
    let output = collected.aggregator.into_output().unwrap();

    // arrival order is up to the workers, numbering is not
    let nums: Vec<usize> = output.iterations().iter().map(|i| i.iter_num).collect();
    assert_eq!(nums, vec![1, 2, 3]);
    let ids: HashSet<&str> = output
        .iterations()
        .iter()
        .map(|i| i.query_id.as_str())
        .collect();
    assert_eq!(ids, HashSet::from(["q1", "q2", "q3"]));
}

#[test]
fn test_plastn_reverse_strand_hit() {
    let ws = Workspace::new();
    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/test-data");
    let config = JobConfig::new(
        "plastn",
        data.join("nucl_query.fa"),
        data.join("nucl_subject.fa"),
        ws.output.clone(),
    )
    .cores(1)
    .filter(false)
    .working_dir(ws.root());

    let report = run_job(&LocalEngine::new(), &config).unwrap();
    let iteration = &report.output.iterations()[0];
    assert_eq!(iteration.query_id, "nq1");
    let hit = &iteration.hits()[0];
    assert_eq!(hit.id, "ns1");

    // the subject carries the query's reverse complement at 21..80
    let hsp = &hit.hsps()[0];
    assert_eq!(hsp.score.identity, 60);
    assert_eq!((hsp.query.from, hsp.query.to, hsp.query.frame), (1, 60, 1));
    assert_eq!((hsp.subject.from, hsp.subject.to, hsp.subject.frame), (80, 21, -1));
    assert!(hsp.subject.from > hsp.subject.to);

    let xml = std::fs::read_to_string(&ws.output).unwrap();
    assert!(xml.contains("<Hsp_hit-from>80</Hsp_hit-from>"));
    assert!(xml.contains("<Hsp_hit-to>21</Hsp_hit-to>"));
    assert!(xml.contains("<Hsp_hit-frame>-1</Hsp_hit-frame>"));
}
