//! NCBI BLAST XML output.
use std::io::Write;

use anyhow::Result;

use super::ReportWriter;
use crate::coords::CoordinateBlock;
use crate::report::{Hit, Hsp, Iteration, Output};
use crate::utils::xml_escape;

const INDENT: &str = "  ";

pub struct XmlWriter;

fn line(out: &mut dyn Write, depth: usize, text: &str) -> Result<()> {
    for _ in 0..depth {
        out.write_all(INDENT.as_bytes())?;
    }
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

/// `<tag>value</tag>` with the value escaped.
fn element(out: &mut dyn Write, depth: usize, tag: &str, value: impl std::fmt::Display) -> Result<()> {
    let value = value.to_string();
    line(
        out,
        depth,
        &format!("<{}>{}</{}>", tag, xml_escape(&value), tag),
    )
}

fn sequence_element(
    out: &mut dyn Write,
    depth: usize,
    tag: &str,
    block: Option<&CoordinateBlock>,
) -> Result<()> {
    match block.and_then(|b| b.sequence.as_deref()) {
        Some(seq) => element(out, depth, tag, seq),
        None => line(out, depth, &format!("<{}/>", tag)),
    }
}

impl XmlWriter {
    fn write_header(&self, output: &Output, out: &mut dyn Write) -> Result<()> {
        let request = output.request();
        line(out, 0, "<?xml version=\"1.0\"?>")?;
        line(
            out,
            0,
            "<!DOCTYPE BlastOutput PUBLIC \"-//NCBI//NCBI BlastOutput/EN\" \"http://www.ncbi.nlm.nih.gov/dtd/NCBI_BlastOutput.dtd\">",
        )?;
        line(out, 0, "<BlastOutput>")?;
        element(out, 1, "BlastOutput_program", &request.program)?;
        element(out, 1, "BlastOutput_version", &request.version)?;
        element(out, 1, "BlastOutput_reference", &request.reference)?;
        element(out, 1, "BlastOutput_db", &request.database)?;
        element(out, 1, "BlastOutput_query-ID", &request.query_id)?;
        element(out, 1, "BlastOutput_query-def", &request.query_def)?;
        element(out, 1, "BlastOutput_query-len", request.query_len)?;

        let params = output.params();
        line(out, 1, "<BlastOutput_param>")?;
        line(out, 2, "<Parameters>")?;
        for (tag, value) in [
            ("Parameters_matrix", &params.matrix),
            ("Parameters_expect", &params.expect),
            ("Parameters_gap-open", &params.gap_open),
            ("Parameters_gap-extend", &params.gap_extend),
            ("Parameters_filter", &params.filter),
        ] {
            if let Some(value) = value {
                element(out, 3, tag, value)?;
            }
        }
        line(out, 2, "</Parameters>")?;
        line(out, 1, "</BlastOutput_param>")?;
        Ok(())
    }

    fn write_iteration(&self, iteration: &Iteration, out: &mut dyn Write) -> Result<()> {
        line(out, 2, "<Iteration>")?;
        element(out, 3, "Iteration_iter-num", iteration.iter_num)?;
        element(out, 3, "Iteration_query-ID", &iteration.query_id)?;
        element(out, 3, "Iteration_query-def", &iteration.query_def)?;
        element(out, 3, "Iteration_query-len", iteration.query_len)?;
        if iteration.hits().is_empty() {
            line(out, 3, "<Iteration_hits></Iteration_hits>")?;
        } else {
            line(out, 3, "<Iteration_hits>")?;
            for hit in iteration.hits() {
                self.write_hit(hit, out)?;
            }
            line(out, 3, "</Iteration_hits>")?;
        }
        if let Some(message) = iteration.message() {
            element(out, 3, "Iteration_message", message)?;
        }
        line(out, 2, "</Iteration>")?;
        Ok(())
    }

    fn write_hit(&self, hit: &Hit, out: &mut dyn Write) -> Result<()> {
        line(out, 4, "<Hit>")?;
        element(out, 5, "Hit_num", hit.num)?;
        element(out, 5, "Hit_id", &hit.id)?;
        element(out, 5, "Hit_def", &hit.def)?;
        element(out, 5, "Hit_accession", &hit.accession)?;
        element(out, 5, "Hit_len", hit.len)?;
        line(out, 5, "<Hit_hsps>")?;
        for hsp in hit.hsps() {
            self.write_hsp(hsp, out)?;
        }
        line(out, 5, "</Hit_hsps>")?;
        line(out, 4, "</Hit>")?;
        Ok(())
    }

    fn write_hsp(&self, hsp: &Hsp, out: &mut dyn Write) -> Result<()> {
        let score = &hsp.score;
        line(out, 6, "<Hsp>")?;
        element(out, 7, "Hsp_num", hsp.num)?;
        element(out, 7, "Hsp_bit-score", format!("{:.4}", score.bit_score))?;
        element(out, 7, "Hsp_score", score.score)?;
        element(out, 7, "Hsp_evalue", format!("{:e}", score.evalue))?;
        element(out, 7, "Hsp_query-from", hsp.query.from)?;
        element(out, 7, "Hsp_query-to", hsp.query.to)?;
        element(out, 7, "Hsp_hit-from", hsp.subject.from)?;
        element(out, 7, "Hsp_hit-to", hsp.subject.to)?;
        element(out, 7, "Hsp_query-frame", hsp.query.frame)?;
        element(out, 7, "Hsp_hit-frame", hsp.subject.frame)?;
        element(out, 7, "Hsp_identity", score.identity)?;
        element(out, 7, "Hsp_positive", score.positive)?;
        element(out, 7, "Hsp_gaps", score.gaps)?;
        element(out, 7, "Hsp_align-len", score.align_len)?;
        sequence_element(out, 7, "Hsp_qseq", Some(&hsp.query))?;
        sequence_element(out, 7, "Hsp_hseq", Some(&hsp.subject))?;
        sequence_element(out, 7, "Hsp_midline", hsp.midline.as_ref())?;
        line(out, 6, "</Hsp>")?;
        Ok(())
    }
}

impl ReportWriter for XmlWriter {
    fn write_report(&self, output: &Output, out: &mut dyn Write) -> Result<()> {
        self.write_header(output, out)?;
        line(out, 1, "<BlastOutput_iterations>")?;
        for iteration in output.iterations() {
            self.write_iteration(iteration, out)?;
        }
        line(out, 1, "</BlastOutput_iterations>")?;
        line(out, 0, "</BlastOutput>")?;
        Ok(())
    }
}
