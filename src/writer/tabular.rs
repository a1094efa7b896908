//! Tab-separated output, one row per HSP, in the classical 12-column layout.
use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use super::{ReportWriter, WriterOptions};
use crate::coords::CoordinateBlock;
use crate::report::{Hit, Hsp, Iteration, Output};

#[derive(Serialize)]
struct TabularRow<'a> {
    qseqid: &'a str,
    sseqid: &'a str,
    pident: String,
    length: u32,
    mismatch: u32,
    gapopen: u32,
    qstart: u32,
    qend: u32,
    sstart: u32,
    send: u32,
    evalue: String,
    bitscore: String,
}

impl<'a> TabularRow<'a> {
    fn new(iteration: &'a Iteration, hit: &'a Hit, hsp: &'a Hsp) -> Self {
        let score = &hsp.score;
        Self {
            qseqid: &iteration.query_id,
            sseqid: &hit.id,
            pident: format!("{:.2}", score.percent_identity()),
            length: score.align_len,
            mismatch: score
                .align_len
                .saturating_sub(score.identity)
                .saturating_sub(score.gaps),
            gapopen: gap_openings(&hsp.query) + gap_openings(&hsp.subject),
            qstart: hsp.query.from,
            qend: hsp.query.to,
            sstart: hsp.subject.from,
            send: hsp.subject.to,
            evalue: format!("{:.2e}", score.evalue),
            bitscore: format!("{:.1}", score.bit_score),
        }
    }
}

/// Number of gap runs in an aligned sequence, 0 when it is unknown.
fn gap_openings(block: &CoordinateBlock) -> u32 {
    let Some(seq) = block.sequence.as_deref() else {
        return 0;
    };
    let mut openings = 0;
    let mut in_gap = false;
    for ch in seq.chars() {
        let gap = !(ch.is_alphabetic() || ch == '*');
        if gap && !in_gap {
            openings += 1;
        }
        in_gap = gap;
    }
    openings
}

pub struct TabularWriter {
    options: WriterOptions,
}

impl TabularWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    fn hits<'a>(&self, iteration: &'a Iteration) -> &'a [Hit] {
        let hits = iteration.hits();
        if self.options.best_hit_only {
            &hits[..hits.len().min(1)]
        } else {
            hits
        }
    }

    fn hsps<'a>(&self, hit: &'a Hit) -> &'a [Hsp] {
        let hsps = hit.hsps();
        if self.options.first_hsp_only {
            &hsps[..hsps.len().min(1)]
        } else {
            hsps
        }
    }
}

impl ReportWriter for TabularWriter {
    fn write_report(&self, output: &Output, out: &mut dyn Write) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(self.options.header)
            .from_writer(out);

        for iteration in output.iterations() {
            for hit in self.hits(iteration) {
                for hsp in self.hsps(hit) {
                    writer.serialize(TabularRow::new(iteration, hit, hsp))?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::{normalize, SequenceType};
    use crate::report::{
        OutputMetadata, ProgramKind, RequestInfo, ScoreBlock, SearchParameters,
    };

    fn score(evalue: f64) -> ScoreBlock {
        ScoreBlock {
            evalue,
            score: 60.0,
            bit_score: 27.71,
            identity: 8,
            positive: 9,
            gaps: 1,
            align_len: 10,
        }
    }

    // q1: s1 (2 hsps), s2 (1 hsp); q2: no hits
    fn sample_output() -> Output {
        let mut output = Output::new(OutputMetadata {
            kind: ProgramKind::BlastP,
            request: RequestInfo {
                query_id: "q1".to_string(),
                query_def: String::new(),
                query_len: 20,
                database: "bank.fa".to_string(),
                program: "blastp".to_string(),
                version: "PLAST 2.3.1".to_string(),
                reference: String::new(),
            },
            params: SearchParameters::default(),
        });
        let iteration = output.append_iteration("q1", "", 20);
        let hit = iteration.append_hit("s1", "", 50);
        hit.append_hsp(
            score(1e-5),
            normalize(1, 10, 1, 20, Some("MKV-LLWRTA"), SequenceType::Aligned),
            normalize(30, 21, -1, 50, Some("MKVQLL--TA"), SequenceType::Aligned),
            None,
            true,
        );
        hit.append_hsp(
            score(0.5),
            normalize(12, 20, 1, 20, None, SequenceType::Aligned),
            normalize(1, 9, 1, 50, None, SequenceType::Aligned),
            None,
            true,
        );
        iteration.append_hit("s2", "", 70).append_hsp(
            score(2.0),
            normalize(2, 8, 1, 20, None, SequenceType::Aligned),
            normalize(3, 9, 1, 70, None, SequenceType::Aligned),
            None,
            true,
        );
        output.append_iteration("q2", "", 20);
        output
    }

    fn render(options: WriterOptions) -> Vec<String> {
        let mut buf = Vec::new();
        TabularWriter::new(options)
            .write_report(&sample_output(), &mut buf)
            .unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_all_rows() {
        let rows = render(WriterOptions::default());
        assert_eq!(rows.len(), 3, "one row per hsp: {:?}", rows);
        assert_eq!(
            rows[0],
            "q1\ts1\t80.00\t10\t1\t2\t1\t10\t30\t21\t1.00e-5\t27.7"
        );
        assert!(rows[2].starts_with("q1\ts2\t"));
    }

    #[test]
    fn test_header() {
        let rows = render(WriterOptions {
            header: true,
            ..Default::default()
        });
        assert_eq!(
            rows[0],
            "qseqid\tsseqid\tpident\tlength\tmismatch\tgapopen\tqstart\tqend\tsstart\tsend\tevalue\tbitscore"
        );
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_best_hit_and_first_hsp_are_independent() {
        let best_hit = render(WriterOptions {
            best_hit_only: true,
            ..Default::default()
        });
        assert_eq!(best_hit.len(), 2, "both hsps of the best hit: {:?}", best_hit);
        assert!(best_hit.iter().all(|r| r.starts_with("q1\ts1\t")));

        let first_hsp = render(WriterOptions {
            first_hsp_only: true,
            ..Default::default()
        });
        assert_eq!(first_hsp.len(), 2, "first hsp of each hit: {:?}", first_hsp);
        assert!(first_hsp[1].starts_with("q1\ts2\t"));

        let both = render(WriterOptions {
            best_hit_only: true,
            first_hsp_only: true,
            header: false,
        });
        assert_eq!(both.len(), 1);
    }

    #[test]
    fn test_gap_openings() {
        let block = normalize(1, 9, 1, 9, Some("A--C-DE**"), SequenceType::Aligned);
        assert_eq!(gap_openings(&block), 2);
        let block = normalize(1, 9, 1, 9, None, SequenceType::Aligned);
        assert_eq!(gap_openings(&block), 0);
    }
}
