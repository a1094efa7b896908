//! The hierarchical search report: Output -> Iteration -> Hit -> Hsp.
//!
//! Entities are built whole and only ever grow by appending children.
//! Every append numbers the new child `count + 1`, so numbering follows
//! call order and never the numbering an engine may carry.

use serde::Serialize;

use crate::coords::CoordinateBlock;

/// Program names understood by the engine, with the report kind they map to.
const PROGRAM_KINDS: &[(&str, ProgramKind)] = &[
    ("plastp", ProgramKind::BlastP),
    ("plastn", ProgramKind::BlastN),
    ("plastx", ProgramKind::BlastX),
    ("tplastn", ProgramKind::TBlastN),
    ("tplastx", ProgramKind::TBlastX),
];

pub const PROGRAM_VERSION: &str = "PLAST 2.3.1";
pub const PROGRAM_REFERENCE: &str = "Nguyen VH, Lavenier D. (2009) PLAST: parallel local alignment search tool for database comparison. BMC Bioinformatics, vol 10, no 329.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgramKind {
    /// protein query vs protein bank
    BlastP,
    /// nucleotide query vs nucleotide bank
    BlastN,
    /// translated nucleotide query vs protein bank
    BlastX,
    /// protein query vs translated nucleotide bank
    TBlastN,
    /// translated nucleotide query vs translated nucleotide bank
    TBlastX,
    Unknown,
}

impl ProgramKind {
    /// Unknown names are classified, never rejected.
    pub fn from_program_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        PROGRAM_KINDS
            .iter()
            .find(|(prgm, _)| *prgm == name)
            .map(|(_, kind)| *kind)
            .unwrap_or(ProgramKind::Unknown)
    }

    pub fn is_proteic(&self) -> bool {
        *self != ProgramKind::BlastN
    }

    pub fn query_is_nucleotide(&self) -> bool {
        matches!(
            self,
            ProgramKind::BlastN | ProgramKind::BlastX | ProgramKind::TBlastX
        )
    }

    pub fn subject_is_nucleotide(&self) -> bool {
        matches!(
            self,
            ProgramKind::BlastN | ProgramKind::TBlastN | ProgramKind::TBlastX
        )
    }

    pub fn query_is_translated(&self) -> bool {
        matches!(self, ProgramKind::BlastX | ProgramKind::TBlastX)
    }

    pub fn subject_is_translated(&self) -> bool {
        matches!(self, ProgramKind::TBlastN | ProgramKind::TBlastX)
    }
}

impl std::fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let description = match self {
            ProgramKind::BlastP => "blastp",
            ProgramKind::BlastN => "blastn",
            ProgramKind::BlastX => "blastx",
            ProgramKind::TBlastN => "tblastn",
            ProgramKind::TBlastX => "tblastx",
            ProgramKind::Unknown => "unknown",
        };
        write!(f, "{}", description)
    }
}

/// Rewrite an engine program name to its classical counterpart
/// ("plastp" -> "blastp") so report readers recognise it.
pub fn report_program_name(program: &str) -> String {
    let mut chars = program.chars();
    match chars.next() {
        Some(_) => format!("b{}", chars.as_str()),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestInfo {
    pub query_id: String,
    pub query_def: String,
    pub query_len: u32,
    pub database: String,
    pub program: String,
    pub version: String,
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchParameters {
    /// Every engine property, verbatim.
    pub values: Vec<(String, String)>,
    pub expect: Option<String>,
    pub gap_open: Option<String>,
    pub gap_extend: Option<String>,
    pub matrix: Option<String>,
    pub filter: Option<String>,
}

/// Everything needed to create an [`Output`], taken from the first result.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMetadata {
    pub kind: ProgramKind,
    pub request: RequestInfo,
    pub params: SearchParameters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutputSummary {
    pub queries: usize,
    pub matching_queries: usize,
    pub hits: usize,
    pub hsps: usize,
    pub best_evalue: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    kind: ProgramKind,
    request: RequestInfo,
    params: SearchParameters,
    iterations: Vec<Iteration>,
    summary: Option<OutputSummary>,
}

impl Output {
    pub fn new(meta: OutputMetadata) -> Self {
        Self {
            kind: meta.kind,
            request: meta.request,
            params: meta.params,
            iterations: vec![],
            summary: None,
        }
    }

    /// A report for a job that never delivered a result.
    pub fn empty(kind: ProgramKind, request: RequestInfo, params: SearchParameters) -> Self {
        let mut output = Self::new(OutputMetadata {
            kind,
            request,
            params,
        });
        output.finalize();
        output
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn params(&self) -> &SearchParameters {
        &self.params
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    pub fn summary(&self) -> Option<&OutputSummary> {
        self.summary.as_ref()
    }

    pub fn append_iteration(
        &mut self,
        query_id: &str,
        query_def: &str,
        query_len: u32,
    ) -> &mut Iteration {
        let iteration = Iteration {
            iter_num: self.iterations.len() + 1,
            query_id: query_id.to_string(),
            query_def: query_def.to_string(),
            query_len,
            hits: vec![],
        };
        self.iterations.push(iteration);
        // just pushed
        let last = self.iterations.len() - 1;
        &mut self.iterations[last]
    }

    /// Compute the whole-tree aggregates. Safe to call repeatedly.
    pub fn finalize(&mut self) {
        let mut summary = OutputSummary {
            queries: self.iterations.len(),
            ..Default::default()
        };
        for iteration in &self.iterations {
            if !iteration.hits.is_empty() {
                summary.matching_queries += 1;
            }
            summary.hits += iteration.hits.len();
            for hit in &iteration.hits {
                summary.hsps += hit.hsps.len();
                for hsp in &hit.hsps {
                    let evalue = hsp.score.evalue;
                    summary.best_evalue = Some(match summary.best_evalue {
                        Some(best) if best <= evalue => best,
                        _ => evalue,
                    });
                }
            }
        }
        self.summary = Some(summary);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Iteration {
    pub iter_num: usize,
    pub query_id: String,
    pub query_def: String,
    pub query_len: u32,
    hits: Vec<Hit>,
}

impl Iteration {
    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    pub fn message(&self) -> Option<&'static str> {
        if self.hits.is_empty() {
            Some("No hits found")
        } else {
            None
        }
    }

    pub fn append_hit(&mut self, id: &str, def: &str, len: u32) -> &mut Hit {
        let hit = Hit {
            num: self.hits.len() + 1,
            id: id.to_string(),
            accession: id.to_string(),
            def: def.to_string(),
            len,
            hsps: vec![],
        };
        self.hits.push(hit);
        let last = self.hits.len() - 1;
        &mut self.hits[last]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub num: usize,
    pub id: String,
    pub accession: String,
    pub def: String,
    pub len: u32,
    hsps: Vec<Hsp>,
}

impl Hit {
    pub fn hsps(&self) -> &[Hsp] {
        &self.hsps
    }

    pub fn append_hsp(
        &mut self,
        score: ScoreBlock,
        query: CoordinateBlock,
        subject: CoordinateBlock,
        midline: Option<CoordinateBlock>,
        proteic: bool,
    ) -> &Hsp {
        let hsp = Hsp {
            num: self.hsps.len() + 1,
            score,
            query,
            subject,
            midline,
            proteic,
        };
        self.hsps.push(hsp);
        &self.hsps[self.hsps.len() - 1]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hsp {
    pub num: usize,
    pub score: ScoreBlock,
    pub query: CoordinateBlock,
    pub subject: CoordinateBlock,
    pub midline: Option<CoordinateBlock>,
    pub proteic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBlock {
    pub evalue: f64,
    pub score: f64,
    pub bit_score: f64,
    pub identity: u32,
    pub positive: u32,
    pub gaps: u32,
    pub align_len: u32,
}

impl ScoreBlock {
    pub fn percent_identity(&self) -> f64 {
        if self.align_len == 0 {
            0.0
        } else {
            100.0 * self.identity as f64 / self.align_len as f64
        }
    }
}

/// Holds the single Output of a job, created on first use.
#[derive(Debug, Default)]
pub struct ReportTree {
    output: Option<Output>,
}

impl ReportTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        self.output.is_some()
    }

    /// Create the Output from `meta` on the first call only; later calls
    /// return the existing Output and drop their metadata.
    pub fn ensure_created(&mut self, meta: impl FnOnce() -> OutputMetadata) -> &mut Output {
        self.output.get_or_insert_with(|| Output::new(meta()))
    }

    pub fn output(&self) -> Option<&Output> {
        self.output.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut Output> {
        self.output.as_mut()
    }

    pub fn into_output(self) -> Option<Output> {
        self.output
    }
}
