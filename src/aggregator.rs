//! Turns the engine's event stream into a single report.
//!
//! The engine calls [`ResultAggregator`] from any of its threads. Those
//! calls are converted into [`AggregatorEvent`] messages and sent over a
//! bounded channel to one consumer thread, which owns the
//! [`ReportAggregator`] and applies every event in arrival order. All
//! report appends and counters therefore happen on that single thread.
//! Progress notifications bypass the channel.

use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use camino::Utf8Path as Path;
use log::{error, info, warn};
use serde::Serialize;

use crate::coords::{normalize, SequenceType};
use crate::engine::{keys, EngineProperties, QueryResult, RequestListener, ResultBatch};
use crate::error::{AggregatorError, JobState};
use crate::report::{
    report_program_name, Output, OutputMetadata, ProgramKind, ReportTree, RequestInfo,
    ScoreBlock, SearchParameters, PROGRAM_REFERENCE, PROGRAM_VERSION,
};

/// Running totals over everything delivered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queries: usize,
    pub matching_queries: usize,
    pub hits: usize,
    pub hsps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    Started,
    ResultAvailable(ResultBatch),
    Finished,
    Cancelled,
}

impl AggregatorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AggregatorEvent::Started => "started",
            AggregatorEvent::ResultAvailable(_) => "result-available",
            AggregatorEvent::Finished => "finished",
            AggregatorEvent::Cancelled => "cancelled",
        }
    }
}

/// Report-building state machine for one job.
#[derive(Debug)]
pub struct ReportAggregator {
    program: String,
    kind: ProgramKind,
    database: String,
    properties: EngineProperties,
    tree: ReportTree,
    stats: JobStats,
    state: JobState,
}

impl ReportAggregator {
    pub fn new(program: &str, subject: &Path, properties: EngineProperties) -> Self {
        let database = subject
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| subject.to_string());
        Self {
            program: program.to_string(),
            kind: ProgramKind::from_program_name(program),
            database,
            properties,
            tree: ReportTree::new(),
            stats: JobStats::default(),
            state: JobState::Idle,
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn stats(&self) -> JobStats {
        self.stats
    }

    /// `None` until the first query result has been delivered.
    pub fn output(&self) -> Option<&Output> {
        self.tree.output()
    }

    pub fn into_output(self) -> Option<Output> {
        self.tree.into_output()
    }

    /// The Output, or an empty one when no query was ever delivered.
    pub fn into_output_or_empty(self) -> Output {
        let kind = self.kind;
        let request = self.request_info(None);
        let params = self.search_parameters();
        self.tree
            .into_output()
            .unwrap_or_else(|| Output::empty(kind, request, params))
    }

    pub fn apply(&mut self, event: AggregatorEvent) -> Result<(), AggregatorError> {
        match event {
            AggregatorEvent::Started => self.on_started(),
            AggregatorEvent::ResultAvailable(batch) => self.on_result_available(&batch),
            AggregatorEvent::Finished => self.on_finished(),
            AggregatorEvent::Cancelled => self.on_cancelled(),
        }
    }

    fn ensure_not_terminated(&self, event: &'static str) -> Result<(), AggregatorError> {
        if self.state.is_terminal() {
            return Err(AggregatorError::AlreadyTerminated {
                event,
                state: self.state,
            });
        }
        Ok(())
    }

    pub fn on_started(&mut self) -> Result<(), AggregatorError> {
        if self.state != JobState::Idle {
            return Err(AggregatorError::AlreadyStarted { state: self.state });
        }
        info!("PLAST execution started!");
        self.state = JobState::Started;
        Ok(())
    }

    pub fn on_result_available(&mut self, batch: &ResultBatch) -> Result<(), AggregatorError> {
        self.ensure_not_terminated("result-available")?;
        self.state = JobState::Running;

        let proteic = self.kind.is_proteic();
        for query in &batch.queries {
            self.stats.queries += 1;

            if !self.tree.is_created() {
                let meta = OutputMetadata {
                    kind: self.kind,
                    request: self.request_info(Some(query)),
                    params: self.search_parameters(),
                };
                self.tree.ensure_created(|| meta);
            }
            let Some(output) = self.tree.output_mut() else {
                continue;
            };

            let iteration = output.append_iteration(&query.id, &query.definition, query.length);
            if query.has_hits() {
                self.stats.matching_queries += 1;
            }

            for hit in &query.hits {
                self.stats.hits += 1;
                let report_hit = iteration.append_hit(&hit.id, &hit.definition, hit.length);

                for hsp in &hit.hsps {
                    self.stats.hsps += 1;

                    let score = ScoreBlock {
                        evalue: hsp.evalue,
                        score: hsp.score,
                        bit_score: hsp.bit_score,
                        identity: hsp.identity,
                        positive: hsp.positive,
                        gaps: hsp.gaps,
                        align_len: hsp.align_len,
                    };
                    let query_coords = normalize(
                        hsp.query_from,
                        hsp.query_to,
                        hsp.query_frame,
                        hsp.query_len,
                        hsp.query_seq.as_deref(),
                        SequenceType::Aligned,
                    );
                    let subject_coords = normalize(
                        hsp.subject_from,
                        hsp.subject_to,
                        hsp.subject_frame,
                        hsp.subject_len,
                        hsp.subject_seq.as_deref(),
                        SequenceType::Aligned,
                    );
                    let midline = hsp.midline.as_deref().map(|m| {
                        normalize(
                            hsp.query_from,
                            hsp.query_to,
                            hsp.query_frame,
                            hsp.query_len,
                            Some(m),
                            SequenceType::Midline,
                        )
                    });
                    report_hit.append_hsp(score, query_coords, subject_coords, midline, proteic);
                }
            }
        }
        Ok(())
    }

    pub fn on_finished(&mut self) -> Result<(), AggregatorError> {
        self.ensure_not_terminated("finished")?;
        if let Some(output) = self.tree.output_mut() {
            output.finalize();
        }
        self.state = JobState::Finished;
        info!("PLAST execution done!");
        Ok(())
    }

    pub fn on_cancelled(&mut self) -> Result<(), AggregatorError> {
        self.ensure_not_terminated("cancelled")?;
        self.state = JobState::Cancelled;
        warn!("PLAST execution cancelled");
        Ok(())
    }

    fn request_info(&self, query: Option<&QueryResult>) -> RequestInfo {
        let (query_id, query_def, query_len) = match query {
            Some(q) => (q.id.clone(), q.definition.clone(), q.length),
            None => (String::new(), String::new(), 0),
        };
        RequestInfo {
            query_id,
            query_def,
            query_len,
            database: self.database.clone(),
            program: report_program_name(&self.program),
            version: PROGRAM_VERSION.to_string(),
            reference: format!("{}: {}", self.program.to_uppercase(), PROGRAM_REFERENCE),
        }
    }

    fn search_parameters(&self) -> SearchParameters {
        let props = &self.properties;
        let get = |key: &str| props.get(key).map(str::to_string);
        SearchParameters {
            values: props
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            expect: get(keys::EVALUE),
            gap_open: get(keys::OPEN_GAP_COST),
            gap_extend: get(keys::EXTEND_GAP_COST),
            matrix: get(keys::SCORE_MATRIX),
            filter: get(keys::FILTER_QUERY),
        }
    }
}

/// What the consumer thread hands back once the channel closes.
#[derive(Debug)]
pub struct AggregationResult {
    pub aggregator: ReportAggregator,
    /// First internal error; events after it were not applied.
    pub error: Option<AggregatorError>,
}

/// Apply events from `recv` until every sender is gone.
pub fn aggregator_thread(
    recv: Receiver<AggregatorEvent>,
    mut aggregator: ReportAggregator,
) -> JoinHandle<AggregationResult> {
    std::thread::spawn(move || {
        let mut first_error = None;
        for event in recv.iter() {
            if first_error.is_some() {
                continue;
            }
            let name = event.name();
            if let Err(e) = aggregator.apply(event) {
                error!("Unable to handle '{}' event: {}", name, e);
                first_error = Some(e);
            }
        }
        AggregationResult {
            aggregator,
            error: first_error,
        }
    })
}

/// The listener registered with the engine for one job.
pub struct ResultAggregator {
    sender: Mutex<Option<SyncSender<AggregatorEvent>>>,
    thread: Mutex<Option<JoinHandle<AggregationResult>>>,
    progress: AtomicU64,
    params_logged: AtomicBool,
    params_json: String,
}

impl ResultAggregator {
    /// Start the consumer thread for `aggregator`.
    pub fn spawn(aggregator: ReportAggregator) -> Self {
        let params_json = aggregator.properties.to_json();
        // bounded like the writer channels, one slot per worker
        let (send, recv) =
            std::sync::mpsc::sync_channel::<AggregatorEvent>(rayon::current_num_threads());
        let thrd = aggregator_thread(recv, aggregator);

        Self {
            sender: Mutex::new(Some(send)),
            thread: Mutex::new(Some(thrd)),
            progress: AtomicU64::new(0f64.to_bits()),
            params_logged: AtomicBool::new(false),
            params_json,
        }
    }

    /// Last reported progress, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(atomic::Ordering::SeqCst))
    }

    pub fn is_detached(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    fn send(&self, event: AggregatorEvent) {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match sender {
            Some(s) => {
                if let Err(e) = s.send(event) {
                    error!("Unable to send internal data: {:?}", e.0.name());
                }
            }
            None => warn!("'{}' event received after detach, ignored", event.name()),
        }
    }

    /// Close the channel and wait for the consumer to finish. Events
    /// arriving afterwards are dropped.
    pub fn detach(&self) -> Result<AggregationResult> {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let thrd = self
            .thread
            .lock()
            .map_err(|_| anyhow!("aggregator lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("aggregator already detached"))?;

        thrd.join()
            .map_err(|e| anyhow!("Unable to join aggregator thread: {:?}", e))
    }
}

impl RequestListener for ResultAggregator {
    fn started(&self) {
        self.send(AggregatorEvent::Started);
    }

    fn progress(&self, percent_done: f64) {
        if !self.params_logged.swap(true, atomic::Ordering::SeqCst) {
            info!("Parameters used by PLAST are: {}", self.params_json);
        }
        let percent_done = percent_done.clamp(0.0, 1.0);
        self.progress
            .store(percent_done.to_bits(), atomic::Ordering::SeqCst);
        info!("Job progress: {:.1}%", percent_done * 100.0);
    }

    fn result_available(&self, batch: ResultBatch) {
        self.send(AggregatorEvent::ResultAvailable(batch));
    }

    fn finished(&self) {
        self.send(AggregatorEvent::Finished);
    }

    fn cancelled(&self) {
        self.send(AggregatorEvent::Cancelled);
    }
}
