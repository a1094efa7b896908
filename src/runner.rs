//! Run one comparison job from start to finish.
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path as Path;
use camino::Utf8PathBuf as PathBuf;
use log::{info, warn};

use crate::aggregator::{JobStats, ReportAggregator, ResultAggregator};
use crate::engine::{keys, Engine, EngineProperties, Request};
use crate::error::{JobState, PlastError};
use crate::report::Output;
use crate::utils::{check_input_file, format_running_time, InputType};
use crate::writer::{write_report, ReportFormat, WriterOptions};

pub const DEFAULT_CORES: usize = 4;
/// How long a cancelled engine gets to wind down before it is abandoned.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);
/// Asks the engine to deliver query results in input order.
pub const FORCE_QUERY_ORDERING: &str = "1000";

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub program: String,
    pub query: PathBuf,
    pub subject: PathBuf,
    pub output: PathBuf,
    pub cores: usize,
    pub max_hits: Option<usize>,
    pub max_hsps: Option<usize>,
    pub evalue: Option<f64>,
    pub seeds: Option<f64>,
    pub filter: Option<bool>,
    pub format: ReportFormat,
    pub writer_options: WriterOptions,
    pub timeout: Option<Duration>,
    pub cancel_grace: Duration,
    /// Where the transient engine file goes; the system temp dir if unset.
    pub working_dir: Option<PathBuf>,
}

impl JobConfig {
    pub fn new(
        program: impl Into<String>,
        query: impl Into<PathBuf>,
        subject: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            query: query.into(),
            subject: subject.into(),
            output: output.into(),
            cores: DEFAULT_CORES,
            max_hits: None,
            max_hsps: None,
            evalue: None,
            seeds: None,
            filter: None,
            format: ReportFormat::default(),
            writer_options: WriterOptions::default(),
            timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            working_dir: None,
        }
    }

    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn max_hits(mut self, max_hits: usize) -> Self {
        self.max_hits = Some(max_hits);
        self
    }

    pub fn max_hsps(mut self, max_hsps: usize) -> Self {
        self.max_hsps = Some(max_hsps);
        self
    }

    pub fn evalue(mut self, evalue: f64) -> Self {
        self.evalue = Some(evalue);
        self
    }

    pub fn seeds(mut self, seeds: f64) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn filter(mut self, filter: bool) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn format(mut self, format: ReportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn writer_options(mut self, options: WriterOptions) -> Self {
        self.writer_options = options;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn validate(&self) -> Result<(), PlastError> {
        check_input_file(&self.query, InputType::Query)
            .map_err(|e| PlastError::Config(e.to_string()))?;
        check_input_file(&self.subject, InputType::Subject)
            .map_err(|e| PlastError::Config(e.to_string()))?;
        if self.cores == 0 {
            return Err(PlastError::Config(
                "number of cores must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The property table handed to the engine.
    pub fn engine_properties(&self, engine_output: &Path) -> EngineProperties {
        let mut props = EngineProperties::new();
        props
            .set(keys::QUERY_URI, self.query.as_str())
            .set(keys::SUBJECT_URI, self.subject.as_str())
            .set(keys::ALGO_TYPE, self.program.as_str())
            .set(keys::OUTPUT_URI, engine_output.as_str())
            .set(keys::NB_PROCESSORS, self.cores.to_string())
            .set_opt(keys::MAX_HIT_PER_QUERY, self.max_hits.map(|v| v.to_string()))
            .set_opt(keys::MAX_HSP_PER_HIT, self.max_hsps.map(|v| v.to_string()))
            .set_opt(keys::EVALUE, self.evalue.map(format_evalue))
            .set_opt(keys::SEEDS_USE_RATIO, self.seeds.map(|v| v.to_string()))
            .set_opt(
                keys::FILTER_QUERY,
                self.filter.map(|f| if f { "T" } else { "F" }),
            )
            .set(keys::FORCE_QUERY_ORDERING, FORCE_QUERY_ORDERING);
        props
    }
}

/// Plain notation for ordinary thresholds, exponent notation for tiny or
/// huge ones ("10", "0.001", "1e-30").
pub fn format_evalue(evalue: f64) -> String {
    let magnitude = evalue.abs();
    if magnitude != 0.0 && !(1e-4..1e6).contains(&magnitude) {
        format!("{:e}", evalue)
    } else {
        evalue.to_string()
    }
}

/// A successfully completed job.
#[derive(Debug)]
pub struct JobReport {
    pub stats: JobStats,
    pub output: Output,
    pub progress: f64,
    pub elapsed: Duration,
}

/// Execute the request, cancelling it if `timeout` expires first. After a
/// cancel the engine gets `grace` to stop; past that it is left running on
/// its own thread and the job is reported as cancelled. Returns whether the
/// deadline was hit.
fn execute(
    request: &Arc<dyn Request>,
    timeout: Option<Duration>,
    grace: Duration,
) -> Result<bool> {
    let Some(timeout) = timeout else {
        request.execute()?;
        return Ok(false);
    };

    let (done_send, done_recv) = std::sync::mpsc::channel::<Result<()>>();
    let engine_request = Arc::clone(request);
    std::thread::Builder::new()
        .name("plast-engine".to_string())
        .spawn(move || {
            let _ = done_send.send(engine_request.execute());
        })
        .context("Unable to start engine thread")?;

    match done_recv.recv_timeout(timeout) {
        Ok(result) => return result.map(|_| false),
        Err(RecvTimeoutError::Disconnected) => bail!("Engine thread panicked"),
        Err(RecvTimeoutError::Timeout) => {}
    }

    warn!(
        "Job did not complete within {}s, cancelling",
        timeout.as_secs_f64()
    );
    request.cancel();
    match done_recv.recv_timeout(grace) {
        Ok(result) => result.map(|_| true),
        Err(RecvTimeoutError::Disconnected) => bail!("Engine thread panicked"),
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Engine still running {}s after cancellation, abandoning it",
                grace.as_secs_f64()
            );
            Ok(true)
        }
    }
}

/// Run a job and write its report. Fails without writing anything when the
/// engine fails, the job is cancelled, or the aggregator hit an internal
/// error.
pub fn run_job(engine: &dyn Engine, config: &JobConfig) -> Result<JobReport> {
    let start = Instant::now();
    let result = run_job_inner(engine, config, start);
    info!(
        "Running time: {}",
        format_running_time(start.elapsed().as_secs())
    );
    result
}

fn run_job_inner(engine: &dyn Engine, config: &JobConfig, start: Instant) -> Result<JobReport> {
    config.validate()?;

    let working_dir = match &config.working_dir {
        Some(dir) => dir.clone(),
        None => PathBuf::try_from(std::env::temp_dir())
            .map_err(|e| anyhow!("Temporary directory is not valid UTF-8: {:?}", e))?,
    };
    // deleted on drop, on every exit path below
    let engine_output = tempfile::Builder::new()
        .prefix("plast")
        .suffix(".tmp")
        .tempfile_in(&working_dir)
        .map_err(PlastError::from)
        .with_context(|| format!("Unable to create temporary file in '{}'", working_dir))?;
    let engine_output_path = Path::from_path(engine_output.path())
        .ok_or_else(|| anyhow!("Temporary file path is not valid UTF-8"))?;

    let props = config.engine_properties(engine_output_path);
    let request = engine
        .create_request(props)
        .map_err(|e| PlastError::Engine(format!("{:#}", e)))?;

    let aggregator = ReportAggregator::new(
        &config.program,
        &config.subject,
        request.properties().clone(),
    );
    let listener = Arc::new(ResultAggregator::spawn(aggregator));
    let listener_id = request.add_listener(listener.clone());

    info!(
        "Starting {} job: '{}' vs '{}'",
        config.program, config.query, config.subject
    );
    let executed = execute(&request, config.timeout, config.cancel_grace);

    request.remove_listener(listener_id);
    let collected = listener.detach()?;
    let progress = listener.progress();

    let stats = collected.aggregator.stats();
    info!("Number of queries: {}", stats.queries);
    info!("Number of matching queries: {}", stats.matching_queries);
    info!("Number of hits: {}", stats.hits);
    info!("Number of HSPs: {}", stats.hsps);

    let timed_out = executed.map_err(|e| PlastError::Engine(format!("{:#}", e)))?;
    if let Some(e) = collected.error {
        return Err(PlastError::Aggregator(e).into());
    }
    match collected.aggregator.state() {
        JobState::Finished if !timed_out => {}
        JobState::Finished | JobState::Cancelled => return Err(PlastError::Cancelled.into()),
        _ if timed_out => return Err(PlastError::Cancelled.into()),
        state => {
            return Err(PlastError::Engine(format!(
                "engine returned while job was {}",
                state
            ))
            .into())
        }
    }

    let output = collected.aggregator.into_output_or_empty();
    write_report(&output, &config.output, config.format, config.writer_options)
        .map_err(|e| PlastError::Serialization(format!("{:#}", e)))?;

    if let Err(e) = engine_output.close() {
        warn!("Unable to remove temporary file: {}", e);
    }

    Ok(JobReport {
        stats,
        output,
        progress,
        elapsed: start.elapsed(),
    })
}
