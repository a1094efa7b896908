//! Utility functions for `plast_runner`.
use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path as Path;
use log::info;
use needletail::parse_fastx_file;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Which user-provided input a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Query,
    Subject,
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let description = match self {
            InputType::Query => "query",
            InputType::Subject => "subject",
        };
        write!(f, "{}", description)
    }
}

/// Make sure an input file exists before anything is submitted.
pub fn check_input_file(path: &Path, input_type: InputType) -> Result<()> {
    if !path.exists() {
        bail!("{} file not found: '{}'", input_type, path);
    }
    if !path.is_file() {
        bail!("{} path is not a file: '{}'", input_type, path);
    }
    Ok(())
}

/// One sequence read from a FASTA/FASTQ file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    pub id: String,
    pub definition: String,
    pub seq: Vec<u8>,
}

impl SequenceEntry {
    /// Split a header line into identifier and definition.
    pub fn from_header(header: &[u8], seq: Vec<u8>) -> Self {
        let header = String::from_utf8_lossy(header);
        let header = header.trim();
        let (id, definition) = match header.split_once(char::is_whitespace) {
            Some((id, def)) => (id.to_string(), def.trim().to_string()),
            None => (header.to_string(), String::new()),
        };
        Self {
            id,
            definition,
            seq,
        }
    }
}

/// Load every record of a sequence file, compressed or not.
pub fn load_sequences(path: &Path) -> Result<Vec<SequenceEntry>> {
    let mut reader = parse_fastx_file(path)
        .map_err(|e| anyhow!("Error opening file '{}': {:?}", path, e))?;

    let mut entries = vec![];
    while let Some(record_result) = reader.next() {
        let record =
            record_result.map_err(|e| anyhow!("Error while processing record: {:?}", e))?;
        entries.push(SequenceEntry::from_header(
            record.id(),
            record.seq().into_owned(),
        ));
    }
    info!("Read {} sequence(s) from '{}'", entries.len(), path);
    Ok(entries)
}

/// Open an output file, gzip-compressed when the name ends with `.gz`.
pub fn open_output_file(output: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(output)
        .with_context(|| format!("Error creating output file: '{}'", output))?;
    let writer = BufWriter::new(file);

    if output.extension().map_or(false, |ext| ext == "gz") {
        let gz = niffler::get_writer(
            Box::new(writer),
            niffler::compression::Format::Gzip,
            niffler::compression::Level::Six,
        )
        .map_err(|e| anyhow!("Error creating compressed output '{}': {:?}", output, e))?;
        Ok(gz)
    } else {
        Ok(Box::new(writer))
    }
}

/// Format a duration as `hh:mm:ss`, prefixed with days past 24 hours.
pub fn format_running_time(total_secs: u64) -> String {
    let seconds = total_secs % 60;
    let minutes = total_secs / 60;
    if minutes >= 60 {
        let hours = minutes / 60;
        let minutes = minutes % 60;
        if hours >= 24 {
            let days = hours / 24;
            return format!("{} days {:02}:{:02}:{:02}", days, hours % 24, minutes, seconds);
        }
        return format!("{:02}:{:02}:{:02}", hours, minutes, seconds);
    }
    format!("00:{:02}:{:02}", minutes, seconds)
}

/// Escape the five XML special characters.
pub fn xml_escape(text: &str) -> std::borrow::Cow<'_, str> {
    if !text.contains(|c: char| matches!(c, '&' | '<' | '>' | '"' | '\'')) {
        return std::borrow::Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    std::borrow::Cow::Owned(escaped)
}
