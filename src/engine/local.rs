//! In-process engine: Smith-Waterman over every query/subject pair.
//!
//! Queries are cut into slices, slices are searched in parallel on a
//! dedicated rayon pool, and each finished slice is delivered to listeners
//! as one [`ResultBatch`]. With query ordering forced, slices are delivered
//! in input order through a reorder buffer; otherwise workers deliver as
//! soon as they finish.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{self, AtomicBool, AtomicUsize};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use bio::alphabets::dna;
use bio::scores::blosum62;
use camino::Utf8PathBuf as PathBuf;
use log::{debug, info};
use rayon::prelude::*;

use crate::engine::translate::{protein_to_nucleotide, six_frames};
use crate::engine::{
    keys, Engine, EngineProperties, HitResult, HspResult, ListenerId, ListenerRegistry,
    QueryResult, Request, RequestListener, ResultBatch,
};
use crate::report::ProgramKind;
use crate::utils::{load_sequences, SequenceEntry};

pub const DEFAULT_SLICE_SIZE: usize = 20;
const DEFAULT_EVALUE: f64 = 10.0;

/// Karlin-Altschul parameters for the scoring systems used below.
#[derive(Debug, Clone, Copy)]
struct ScoringSystem {
    gap_open: i32,
    gap_extend: i32,
    lambda: f64,
    k: f64,
    word_size: usize,
    matrix: &'static str,
}

// BLOSUM62, gap 11/1
const PROTEIN_SCORING: ScoringSystem = ScoringSystem {
    gap_open: -11,
    gap_extend: -1,
    lambda: 0.267,
    k: 0.041,
    word_size: 3,
    matrix: "BLOSUM62",
};

// match 2, mismatch -3, gap 5/2
const NUCLEOTIDE_SCORING: ScoringSystem = ScoringSystem {
    gap_open: -5,
    gap_extend: -2,
    lambda: 0.625,
    k: 0.41,
    word_size: 11,
    matrix: "NUC.2.3",
};

fn nucleotide_score(a: u8, b: u8) -> i32 {
    if a == b && a != b'N' {
        2
    } else {
        -3
    }
}

pub struct LocalEngine {
    slice_size: usize,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
        }
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queries per delivered batch.
    pub fn with_slice_size(slice_size: usize) -> Self {
        Self {
            slice_size: slice_size.max(1),
        }
    }
}

impl Engine for LocalEngine {
    fn create_request(&self, mut props: EngineProperties) -> Result<Arc<dyn Request>> {
        let settings = SearchSettings::from_properties(&props)?;
        for (key, value) in scoring_properties(settings.kind) {
            props.set(key, value);
        }
        Ok(Arc::new(LocalRequest {
            props,
            settings,
            slice_size: self.slice_size,
            listeners: ListenerRegistry::default(),
            cancelled: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone)]
struct SearchSettings {
    kind: ProgramKind,
    query: PathBuf,
    subject: PathBuf,
    workers: usize,
    max_hits: Option<usize>,
    max_hsps: Option<usize>,
    evalue: f64,
    seed_ratio: f64,
    filter: bool,
    ordered: bool,
}

fn parse_opt<T: std::str::FromStr>(props: &EngineProperties, key: &str) -> Result<Option<T>> {
    match props.get(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("cannot parse {}='{}'", key, value)),
        None => Ok(None),
    }
}

fn required<'a>(props: &'a EngineProperties, key: &str) -> Result<&'a str> {
    props
        .get(key)
        .ok_or_else(|| anyhow!("missing mandatory engine property '{}'", key))
}

impl SearchSettings {
    fn from_properties(props: &EngineProperties) -> Result<Self> {
        let program = required(props, keys::ALGO_TYPE)?;
        let kind = ProgramKind::from_program_name(program);
        if kind == ProgramKind::Unknown {
            bail!("unsupported program '{}'", program);
        }

        let seed_ratio = parse_opt::<f64>(props, keys::SEEDS_USE_RATIO)?.unwrap_or(1.0);
        if !(seed_ratio > 0.0 && seed_ratio <= 1.0) {
            bail!("seeds ratio must be in ]0..1], got {}", seed_ratio);
        }

        let filter = match props.get(keys::FILTER_QUERY).map(str::trim) {
            None => true,
            Some("T") | Some("t") | Some("true") => true,
            Some("F") | Some("f") | Some("false") => false,
            Some(other) => bail!("filter must be T or F, got '{}'", other),
        };

        Ok(Self {
            kind,
            query: PathBuf::from(required(props, keys::QUERY_URI)?),
            subject: PathBuf::from(required(props, keys::SUBJECT_URI)?),
            workers: parse_opt::<usize>(props, keys::NB_PROCESSORS)?
                .unwrap_or_else(rayon::current_num_threads)
                .max(1),
            max_hits: parse_opt(props, keys::MAX_HIT_PER_QUERY)?,
            max_hsps: parse_opt(props, keys::MAX_HSP_PER_HIT)?,
            evalue: parse_opt(props, keys::EVALUE)?.unwrap_or(DEFAULT_EVALUE),
            seed_ratio,
            filter,
            ordered: props.get(keys::FORCE_QUERY_ORDERING).is_some(),
        })
    }

    fn scoring(&self) -> ScoringSystem {
        if self.kind == ProgramKind::BlastN {
            NUCLEOTIDE_SCORING
        } else {
            PROTEIN_SCORING
        }
    }
}

/// How residues of a searchable frame map back onto the input sequence.
#[derive(Debug, Clone, Copy)]
enum FrameMapping {
    Direct,
    Reverse,
    Translated(i32),
}

#[derive(Debug, Clone)]
struct SearchFrame {
    frame: i32,
    mapping: FrameMapping,
    residues: Vec<u8>,
}

impl SearchFrame {
    /// 1-based, unordered coordinates on the input sequence for the
    /// half-open residue interval `[start, end)`.
    fn coordinates(&self, start: usize, end: usize, input_len: usize) -> (u32, u32) {
        match self.mapping {
            FrameMapping::Direct => ((start + 1) as u32, end as u32),
            FrameMapping::Reverse => ((input_len - start) as u32, (input_len - end + 1) as u32),
            FrameMapping::Translated(frame) => protein_to_nucleotide(frame, start, end, input_len),
        }
    }
}

fn build_frames(seq: &[u8], nucleotide: bool, translated: bool, both_strands: bool) -> Vec<SearchFrame> {
    let unknown = if nucleotide { b'N' } else { b'X' };
    // scoring tables only know upper-case letters and '*'
    let seq: Vec<u8> = seq
        .iter()
        .map(|r| match r.to_ascii_uppercase() {
            r @ (b'A'..=b'Z' | b'*') => r,
            _ => unknown,
        })
        .collect();
    if translated {
        six_frames(&seq)
            .into_iter()
            .map(|f| SearchFrame {
                frame: f.frame,
                mapping: FrameMapping::Translated(f.frame),
                residues: f.protein,
            })
            .collect()
    } else if nucleotide && both_strands {
        vec![
            SearchFrame {
                frame: 1,
                mapping: FrameMapping::Direct,
                residues: seq.clone(),
            },
            SearchFrame {
                frame: -1,
                mapping: FrameMapping::Reverse,
                residues: dna::revcomp(&seq),
            },
        ]
    } else {
        vec![SearchFrame {
            frame: 1,
            mapping: FrameMapping::Direct,
            residues: seq,
        }]
    }
}

/// Mask windows whose Shannon entropy falls under `threshold` bits.
pub fn mask_low_complexity(residues: &mut [u8], window: usize, threshold: f64, mask: u8) {
    if residues.len() < window || window == 0 {
        return;
    }
    let mut to_mask = vec![false; residues.len()];
    for start in 0..=(residues.len() - window) {
        let slice = &residues[start..start + window];
        let mut counts = [0usize; 256];
        for r in slice {
            counts[*r as usize] += 1;
        }
        let entropy: f64 = counts
            .iter()
            .filter(|c| **c > 0)
            .map(|c| {
                let p = *c as f64 / window as f64;
                -p * p.log2()
            })
            .sum();
        if entropy < threshold {
            to_mask[start..start + window].iter_mut().for_each(|m| *m = true);
        }
    }
    for (r, m) in residues.iter_mut().zip(to_mask) {
        if m {
            *r = mask;
        }
    }
}

/// Sampled query words; a subject frame is aligned only if it shares one.
fn sampled_words(residues: &[u8], word_size: usize, seed_ratio: f64) -> HashSet<&[u8]> {
    let step = (1.0 / seed_ratio).ceil().max(1.0) as usize;
    residues
        .windows(word_size)
        .step_by(step)
        .filter(|w| !w.iter().any(|r| matches!(r, b'X' | b'N' | b'*')))
        .collect()
}

fn shares_word(words: &HashSet<&[u8]>, residues: &[u8], word_size: usize) -> bool {
    residues.windows(word_size).any(|w| words.contains(w))
}

struct PreparedSubject {
    entry: SequenceEntry,
    frames: Vec<SearchFrame>,
}

/// Everything a worker needs to search one slice of queries.
struct SearchContext<'a> {
    settings: &'a SearchSettings,
    subjects: &'a [PreparedSubject],
    db_len: f64,
    cancelled: &'a AtomicBool,
}

impl SearchContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }

    /// Results found so far are returned as-is once the request is cancelled.
    fn search_query(&self, query: &SequenceEntry) -> QueryResult {
        let settings = self.settings;
        let scoring = settings.scoring();
        let kind = settings.kind;

        let mut query_frames = build_frames(
            &query.seq,
            kind.query_is_nucleotide(),
            kind.query_is_translated(),
            false,
        );
        if settings.filter {
            for frame in query_frames.iter_mut() {
                if kind == ProgramKind::BlastN {
                    mask_low_complexity(&mut frame.residues, 32, 1.5, b'N');
                } else {
                    mask_low_complexity(&mut frame.residues, 12, 2.2, b'X');
                }
            }
        }

        let mut hits = vec![];
        for subject in self.subjects {
            if self.is_cancelled() {
                break;
            }
            let mut hsps = vec![];
            for qframe in &query_frames {
                let words = sampled_words(&qframe.residues, scoring.word_size, settings.seed_ratio);
                for sframe in &subject.frames {
                    if !shares_word(&words, &sframe.residues, scoring.word_size) {
                        continue;
                    }
                    if let Some(hsp) = self.align(query, qframe, subject, sframe) {
                        if hsp.evalue <= settings.evalue {
                            hsps.push(hsp);
                        }
                    }
                }
            }
            hsps.sort_by(|a, b| a.evalue.total_cmp(&b.evalue));
            if let Some(max_hsps) = settings.max_hsps {
                hsps.truncate(max_hsps);
            }
            if hsps.is_empty() {
                continue;
            }
            hits.push(HitResult {
                id: subject.entry.id.clone(),
                definition: subject.entry.definition.clone(),
                length: subject.entry.seq.len() as u32,
                hsps,
            });
        }

        hits.sort_by(|a, b| a.hsps[0].evalue.total_cmp(&b.hsps[0].evalue));
        if let Some(max_hits) = settings.max_hits {
            hits.truncate(max_hits);
        }

        QueryResult {
            id: query.id.clone(),
            definition: query.definition.clone(),
            length: query.seq.len() as u32,
            hits,
        }
    }

    fn align(
        &self,
        query: &SequenceEntry,
        qframe: &SearchFrame,
        subject: &PreparedSubject,
        sframe: &SearchFrame,
    ) -> Option<HspResult> {
        let scoring = self.settings.scoring();
        let proteic = self.settings.kind.is_proteic();
        let score_fn: fn(u8, u8) -> i32 = if proteic { blosum62 } else { nucleotide_score };

        let x = &qframe.residues;
        let y = &sframe.residues;
        let mut aligner = Aligner::with_capacity(
            x.len(),
            y.len(),
            scoring.gap_open,
            scoring.gap_extend,
            score_fn,
        );
        let alignment = aligner.local(x, y);
        if alignment.score <= 0 {
            return None;
        }

        let mut qseq = String::new();
        let mut sseq = String::new();
        let mut midline = String::new();
        let (mut i, mut j) = (alignment.xstart, alignment.ystart);
        let (mut identity, mut positive, mut gaps) = (0u32, 0u32, 0u32);

        for op in &alignment.operations {
            match op {
                AlignmentOperation::Match | AlignmentOperation::Subst => {
                    let (a, b) = (x[i], y[j]);
                    qseq.push(a as char);
                    sseq.push(b as char);
                    if a == b {
                        identity += 1;
                        positive += 1;
                        midline.push(if proteic { a as char } else { '|' });
                    } else if proteic && score_fn(a, b) > 0 {
                        positive += 1;
                        midline.push('+');
                    } else {
                        midline.push(' ');
                    }
                    i += 1;
                    j += 1;
                }
                AlignmentOperation::Ins => {
                    qseq.push(x[i] as char);
                    sseq.push('-');
                    midline.push(' ');
                    gaps += 1;
                    i += 1;
                }
                AlignmentOperation::Del => {
                    qseq.push('-');
                    sseq.push(y[j] as char);
                    midline.push(' ');
                    gaps += 1;
                    j += 1;
                }
                AlignmentOperation::Xclip(_) | AlignmentOperation::Yclip(_) => {}
            }
        }

        let raw = alignment.score as f64;
        let bit_score = (scoring.lambda * raw - scoring.k.ln()) / std::f64::consts::LN_2;
        let evalue = x.len() as f64 * self.db_len * 2f64.powf(-bit_score);

        let (query_from, query_to) =
            qframe.coordinates(alignment.xstart, alignment.xend, query.seq.len());
        let (subject_from, subject_to) =
            sframe.coordinates(alignment.ystart, alignment.yend, subject.entry.seq.len());

        Some(HspResult {
            evalue,
            score: raw,
            bit_score,
            identity,
            positive,
            gaps,
            align_len: qseq.len() as u32,
            query_from,
            query_to,
            query_frame: qframe.frame,
            query_len: query.seq.len() as u32,
            subject_from,
            subject_to,
            subject_frame: sframe.frame,
            subject_len: subject.entry.seq.len() as u32,
            query_seq: Some(qseq),
            subject_seq: Some(sseq),
            midline: Some(midline),
        })
    }
}

pub struct LocalRequest {
    props: EngineProperties,
    settings: SearchSettings,
    slice_size: usize,
    listeners: ListenerRegistry,
    cancelled: AtomicBool,
}

impl LocalRequest {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }

    fn deliver(&self, batch: ResultBatch, delivered: &AtomicUsize, total: usize) {
        self.listeners
            .notify(|listener| listener.result_available(batch.clone()));
        let done = delivered.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        let percent = done as f64 / total.max(1) as f64;
        self.listeners.notify(|listener| listener.progress(percent));
    }

    fn run(&self) -> Result<()> {
        let settings = &self.settings;
        let kind = settings.kind;

        let queries = load_sequences(&settings.query)
            .with_context(|| format!("Failed to read queries from '{}'", settings.query))?;
        let subjects = load_sequences(&settings.subject)
            .with_context(|| format!("Failed to read subjects from '{}'", settings.subject))?;
        info!(
            "Loaded {} queries and {} subject sequences",
            queries.len(),
            subjects.len()
        );

        let subjects: Vec<PreparedSubject> = subjects
            .into_iter()
            .map(|entry| {
                let frames = build_frames(
                    &entry.seq,
                    kind.subject_is_nucleotide(),
                    kind.subject_is_translated(),
                    kind == ProgramKind::BlastN,
                );
                PreparedSubject { entry, frames }
            })
            .collect();
        let db_len = subjects
            .iter()
            .map(|s| {
                if kind.subject_is_translated() {
                    s.entry.seq.len() / 3
                } else {
                    s.entry.seq.len()
                }
            })
            .sum::<usize>()
            .max(1) as f64;

        let context = SearchContext {
            settings,
            subjects: &subjects,
            db_len,
            cancelled: &self.cancelled,
        };

        let slices: Vec<&[SequenceEntry]> = queries.chunks(self.slice_size).collect();
        let total = slices.len();
        let delivered = AtomicUsize::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers)
            .build()?;

        self.listeners.notify(|listener| listener.started());

        // a cancelled slice is never delivered, even when partly searched
        let search_slice = |slice: &[SequenceEntry]| -> Option<ResultBatch> {
            let mut results = Vec::with_capacity(slice.len());
            for query in slice {
                if self.is_cancelled() {
                    return None;
                }
                results.push(context.search_query(query));
            }
            if self.is_cancelled() {
                return None;
            }
            Some(ResultBatch::new(results))
        };

        if settings.ordered {
            // workers search, this thread delivers in slice order
            let (send, recv) = std::sync::mpsc::sync_channel::<(usize, Option<ResultBatch>)>(
                settings.workers,
            );
            std::thread::scope(|scope| {
                let producer = scope.spawn(|| {
                    pool.install(|| {
                        slices
                            .par_iter()
                            .enumerate()
                            .map(|(idx, slice)| (idx, search_slice(*slice)))
                            .try_for_each_with(send, |s, m| s.send(m))
                    })
                });

                let mut pending = BTreeMap::new();
                let mut next = 0;
                for (idx, batch) in recv.iter() {
                    pending.insert(idx, batch);
                    while let Some(batch) = pending.remove(&next) {
                        if let Some(batch) = batch {
                            self.deliver(batch, &delivered, total);
                        }
                        next += 1;
                    }
                }
                if let Err(e) = producer.join() {
                    log::error!("Unable to join search thread: {:?}", e);
                }
            });
        } else {
            pool.install(|| {
                slices.par_iter().for_each(|slice| {
                    if let Some(batch) = search_slice(*slice) {
                        self.deliver(batch, &delivered, total);
                    }
                })
            });
        }

        debug!(
            "delivered {} of {} slices",
            delivered.load(atomic::Ordering::SeqCst),
            total
        );
        if self.is_cancelled() {
            self.listeners.notify(|listener| listener.cancelled());
        } else {
            self.listeners.notify(|listener| listener.finished());
        }
        Ok(())
    }
}

impl Request for LocalRequest {
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
        self.run()
    }

    fn cancel(&self) {
        self.cancelled.store(true, atomic::Ordering::SeqCst);
    }
}

/// Scoring matrix and gap costs applied for `kind`, reported back to
/// listeners through the request properties.
fn scoring_properties(kind: ProgramKind) -> [(&'static str, String); 3] {
    let scoring = if kind == ProgramKind::BlastN {
        NUCLEOTIDE_SCORING
    } else {
        PROTEIN_SCORING
    };
    [
        (keys::SCORE_MATRIX, scoring.matrix.to_string()),
        (keys::OPEN_GAP_COST, (-scoring.gap_open).to_string()),
        (keys::EXTEND_GAP_COST, (-scoring.gap_extend).to_string()),
    ]
}
