use comfy_table::{presets::UTF8_FULL, Table};
use common::job::format_timestamp;
use common::{JobRecord, StatsSnapshot};
use chrono::NaiveDateTime;
use std::io::Write;

const HEADER: [&str; 5] = ["ID", "Status", "Submitted", "Started", "Finished"];

fn cell(ts: &Option<NaiveDateTime>, missing: &str) -> String {
    ts.as_ref().map(format_timestamp).unwrap_or_else(|| missing.to_string())
}

fn row(job: &JobRecord, missing: &str) -> [String; 5] {
    [
        job.id.to_string(),
        job.status.to_string(),
        cell(&job.submitted, missing),
        cell(&job.started, missing),
        cell(&job.finished, missing),
    ]
}

pub fn jobs_table(jobs: &[JobRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(HEADER);
    for job in jobs {
        table.add_row(row(job, "-"));
    }
    table
}

pub fn write_jobs_csv<W: Write>(writer: W, jobs: &[JobRecord]) -> anyhow::Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(HEADER)?;
    for job in jobs {
        out.write_record(row(job, ""))?;
    }
    out.flush()?;
    Ok(())
}

pub fn job_detail(job: &JobRecord) -> String {
    let mut detail = format!("Job {}\n  Status:    {}\n", job.id, job.status);
    detail.push_str(&format!("  Submitted: {}\n", cell(&job.submitted, "-")));
    detail.push_str(&format!("  Started:   {}\n", cell(&job.started, "-")));
    detail.push_str(&format!("  Finished:  {}\n", cell(&job.finished, "-")));
    if let Some(duration) = job.duration() {
        detail.push_str(&format!("  Duration:  {}s\n", duration.num_seconds()));
    }
    detail
}

pub fn stats_text(snapshot: &StatsSnapshot) -> String {
    format!(
        "Pending jobs:     {}\nProcessed jobs:   {}\nAverage duration: {}",
        snapshot.pending, snapshot.processed, snapshot.average_duration_display
    )
}
