//! Report serializers.
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path as Path;
use clap::ValueEnum;
use log::info;

use crate::report::Output;
use crate::utils::open_output_file;

pub mod tabular;
pub mod xml;

pub use tabular::TabularWriter;
pub use xml::XmlWriter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// NCBI BLAST XML
    #[default]
    Xml,
    /// tab-separated, one line per HSP
    Tabular,
    /// the report tree as JSON
    Json,
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let description = match self {
            ReportFormat::Xml => "xml",
            ReportFormat::Tabular => "tabular",
            ReportFormat::Json => "json",
        };
        write!(f, "{}", description)
    }
}

/// Knobs for the tabular format; ignored by the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterOptions {
    pub best_hit_only: bool,
    pub first_hsp_only: bool,
    pub header: bool,
}

pub trait ReportWriter {
    fn write_report(&self, output: &Output, out: &mut dyn Write) -> Result<()>;
}

pub struct JsonWriter;

impl ReportWriter for JsonWriter {
    fn write_report(&self, output: &Output, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, output)?;
        writeln!(out)?;
        Ok(())
    }
}

pub fn writer_for(format: ReportFormat, options: WriterOptions) -> Box<dyn ReportWriter> {
    match format {
        ReportFormat::Xml => Box::new(XmlWriter),
        ReportFormat::Tabular => Box::new(TabularWriter::new(options)),
        ReportFormat::Json => Box::new(JsonWriter),
    }
}

/// Serialize `output` to `path`, gzip-compressed for `.gz` names.
pub fn write_report(
    output: &Output,
    path: &Path,
    format: ReportFormat,
    options: WriterOptions,
) -> Result<()> {
    info!("Writing {} report to '{}'", format, path);
    let mut out = open_output_file(path)?;
    writer_for(format, options)
        .write_report(output, &mut out)
        .with_context(|| format!("Error writing report '{}'", path))?;
    out.flush()
        .with_context(|| format!("Error flushing report '{}'", path))?;
    Ok(())
}
