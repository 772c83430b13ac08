use std::io::{self, Write};

use serde::Serialize;

use crate::domain::Outcome;
use crate::download::DownloadReport;
use crate::order::OrderSubmitResult;
use crate::query::QueryResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

#[derive(Serialize)]
struct QuerySummary<'a> {
    collection: &'a str,
    records: usize,
    total_reported: Option<u64>,
    skipped: usize,
    pages: usize,
    record_ids: Vec<&'a str>,
}

#[derive(Serialize)]
struct Summary<'a, T: Serialize> {
    outcome: Outcome,
    #[serde(flatten)]
    result: &'a T,
}

impl JsonOutput {
    /// Record ids and counts only; the full records go to the results file.
    pub fn print_query(result: &QueryResult) -> io::Result<()> {
        Self::print_json(&QuerySummary {
            collection: result.collection.id(),
            records: result.len(),
            total_reported: result.total_reported,
            skipped: result.skipped,
            pages: result.pages,
            record_ids: result.records.iter().map(|r| r.record_id.as_str()).collect(),
        })
    }

    pub fn print_order(result: &OrderSubmitResult) -> io::Result<()> {
        Self::print_json(&Summary {
            outcome: result.outcome(),
            result,
        })
    }

    pub fn print_download(report: &DownloadReport) -> io::Result<()> {
        Self::print_json(&Summary {
            outcome: report.outcome(),
            result: report,
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
