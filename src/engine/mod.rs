//! Boundary with the alignment engine.
//!
//! A job is described by a table of string properties, turned into a
//! [`Request`] by an [`Engine`], and executed synchronously. Results come
//! back through [`RequestListener`] callbacks, possibly many times per job
//! and possibly from several engine threads at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

pub mod local;
pub mod translate;

/// Property keys understood by engines.
pub mod keys {
    pub const QUERY_URI: &str = "query_uri";
    pub const SUBJECT_URI: &str = "subject_uri";
    pub const OUTPUT_URI: &str = "output_uri";
    pub const ALGO_TYPE: &str = "algo_type";
    pub const NB_PROCESSORS: &str = "nb_processors";
    pub const MAX_HIT_PER_QUERY: &str = "max_hit_per_query";
    pub const MAX_HSP_PER_HIT: &str = "max_hsp_per_hit";
    pub const EVALUE: &str = "evalue";
    pub const SEEDS_USE_RATIO: &str = "seeds_use_ratio";
    pub const FILTER_QUERY: &str = "filter_query";
    pub const FORCE_QUERY_ORDERING: &str = "force_query_ordering";
    pub const SCORE_MATRIX: &str = "score_matrix";
    pub const OPEN_GAP_COST: &str = "open_gap_cost";
    pub const EXTEND_GAP_COST: &str = "extend_gap_cost";
}

/// Configuration table for one engine job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineProperties {
    values: BTreeMap<String, String>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set_opt(&mut self, key: &str, value: Option<impl Into<String>>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_default()
    }
}

/// One local alignment as reported by the engine. Coordinates are 1-based
/// and not ordered; the aggregator normalizes them.
#[derive(Debug, Clone, PartialEq)]
pub struct HspResult {
    pub evalue: f64,
    pub score: f64,
    pub bit_score: f64,
    pub identity: u32,
    pub positive: u32,
    pub gaps: u32,
    pub align_len: u32,
    pub query_from: u32,
    pub query_to: u32,
    pub query_frame: i32,
    pub query_len: u32,
    pub subject_from: u32,
    pub subject_to: u32,
    pub subject_frame: i32,
    pub subject_len: u32,
    pub query_seq: Option<String>,
    pub subject_seq: Option<String>,
    pub midline: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HitResult {
    pub id: String,
    pub definition: String,
    pub length: u32,
    pub hsps: Vec<HspResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub id: String,
    pub definition: String,
    pub length: u32,
    pub hits: Vec<HitResult>,
}

impl QueryResult {
    pub fn has_hits(&self) -> bool {
        !self.hits.is_empty()
    }
}

/// One delivery: complete results for one or more queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBatch {
    pub queries: Vec<QueryResult>,
}

impl ResultBatch {
    pub fn new(queries: Vec<QueryResult>) -> Self {
        Self { queries }
    }
}

/// Callbacks fired by a running request. Implementations must tolerate
/// concurrent calls.
pub trait RequestListener: Send + Sync {
    fn started(&self);

    /// `percent_done` is in `[0, 1]`.
    fn progress(&self, percent_done: f64);

    fn result_available(&self, batch: ResultBatch);

    fn finished(&self);

    fn cancelled(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub usize);

pub trait Request: Send + Sync {
    fn properties(&self) -> &EngineProperties;

    fn add_listener(&self, listener: Arc<dyn RequestListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Run the job to completion. Blocks.
    fn execute(&self) -> Result<()>;

    /// Ask a running job to stop; it ends by firing `cancelled`.
    ///
    /// Must not block. Timeouts only hold if `execute` notices the request
    /// promptly, so implementations should check between units of work no
    /// larger than a single query/subject comparison. Callers stop waiting
    /// after a grace period and leave a late engine running unobserved.
    fn cancel(&self);
}

pub trait Engine {
    fn create_request(&self, props: EngineProperties) -> Result<Arc<dyn Request>>;
}

/// Listener bookkeeping shared by engine implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: std::sync::atomic::AtomicUsize,
    listeners: std::sync::RwLock<Vec<(ListenerId, Arc<dyn RequestListener>)>>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn RequestListener>) -> ListenerId {
        let id = ListenerId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        );
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn remove(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every registered listener. The lock is not held while
    /// listeners run.
    pub fn notify(&self, f: impl Fn(&dyn RequestListener)) {
        let snapshot: Vec<Arc<dyn RequestListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            f(listener.as_ref());
        }
    }
}
