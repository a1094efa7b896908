use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use camino::Utf8PathBuf as PathBuf;
use clap::Parser;
use log::{error, info};

use plast_runner::engine::local::LocalEngine;
use plast_runner::runner::{run_job, JobConfig, DEFAULT_CORES};
use plast_runner::writer::{ReportFormat, WriterOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compare two sequence banks with PLAST", long_about = None)]
struct Cli {
    /// Program: plastp, plastn, plastx, tplastn or tplastx
    #[arg(short = 'p', long)]
    program: String,

    /// Query bank (FASTA/FASTQ, optionally compressed)
    #[arg(short = 'i', long)]
    query: PathBuf,

    /// Subject bank (FASTA/FASTQ, optionally compressed)
    #[arg(short = 'd', long)]
    subject: PathBuf,

    /// The path for output; gzip-compressed when ending in .gz
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Number of cores to use
    #[arg(short = 'a', long, default_value_t = DEFAULT_CORES)]
    cores: usize,

    /// Maximum number of hits per query
    #[arg(long)]
    max_hits: Option<usize>,

    /// Maximum number of HSPs per hit
    #[arg(long)]
    max_hsps: Option<usize>,

    /// Expect value threshold
    #[arg(short = 'e', long)]
    evalue: Option<f64>,

    /// Ratio of seeds to use, in ]0, 1]
    #[arg(long)]
    seeds: Option<f64>,

    /// Low-complexity filter on queries (T or F)
    #[arg(short = 'F', long, value_parser = parse_filter)]
    filter: Option<bool>,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Xml)]
    format: ReportFormat,

    /// Tabular output: report only the best hit of each query
    #[arg(long)]
    best_hit_only: bool,

    /// Tabular output: report only the first HSP of each hit
    #[arg(long)]
    first_hsp_only: bool,

    /// Tabular output: write a header line
    #[arg(long)]
    header: bool,

    /// Cancel the job after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

fn parse_filter(value: &str) -> Result<bool> {
    match value {
        "T" | "t" => Ok(true),
        "F" | "f" => Ok(false),
        _ => bail!("expected T or F, got '{}'", value),
    }
}

impl Cli {
    fn job_config(&self) -> JobConfig {
        let mut config = JobConfig::new(
            self.program.as_str(),
            self.query.clone(),
            self.subject.clone(),
            self.output.clone(),
        )
        .cores(self.cores)
        .format(self.format)
        .writer_options(WriterOptions {
            best_hit_only: self.best_hit_only,
            first_hsp_only: self.first_hsp_only,
            header: self.header,
        });
        config.max_hits = self.max_hits;
        config.max_hsps = self.max_hsps;
        config.evalue = self.evalue;
        config.seeds = self.seeds;
        config.filter = self.filter;
        config.timeout = self.timeout.map(Duration::from_secs);
        config
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let engine = LocalEngine::new();
    match run_job(&engine, &cli.job_config()) {
        Ok(report) => {
            info!(
                "DONE. Found {} hits over {} queries; report written to '{}'",
                report.stats.hits, report.stats.queries, cli.output
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
