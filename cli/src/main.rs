use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use common::{
    AuditOutcome, AuditReport, DerivedStatus, EventKind, JobEvent, JobId, JobStatus, Request,
    Response,
};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon socket
    #[arg(long, global = true, default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current status of a job
    Status {
        id: String,
    },
    /// Follow a job until it finishes
    Watch {
        id: String,
    },
    /// Stop reconciling a job
    Unwatch {
        id: String,
    },
    /// List watched jobs
    List,
    /// Publish a progress event for a job
    Emit {
        id: String,
        #[arg(long)]
        step: String,
        #[arg(long, default_value = "processing", value_parser = parse_status)]
        status: JobStatus,
        #[arg(long, default_value_t = 0.0)]
        progress: f64,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Publish a keepalive for a job
    Heartbeat {
        id: String,
        #[arg(long, default_value = "processing", value_parser = parse_status)]
        status: JobStatus,
        #[arg(long, default_value_t = 0.0)]
        progress: f64,
    },
    /// Scan recent jobs for ones that look stuck
    Audit {
        /// Max minutes a job may stay queued
        #[arg(long, allow_hyphen_values = true)]
        max_queued: Option<i64>,
        /// Max minutes a job may stay processing
        #[arg(long, allow_hyphen_values = true)]
        max_processing: Option<i64>,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
    Csv,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Connection {
    async fn open(path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", path))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, req: &Request) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec(req)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Response> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Daemon closed the connection"))?;
        Ok(serde_json::from_str(&line)?)
    }

    async fn call(&mut self, req: &Request) -> anyhow::Result<Response> {
        self.send(req).await?;
        self.recv().await
    }
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    match s.parse::<JobStatus>().unwrap_or_default() {
        JobStatus::Unknown => Err(format!(
            "unknown status '{}' (expected queued, processing, done, failed, needs_attention or stalled)",
            s
        )),
        status => Ok(status),
    }
}

fn event(id: String, kind: EventKind, status: JobStatus, progress: f64, message: Option<String>) -> JobEvent {
    JobEvent {
        id: String::new(), // Daemon assigns one
        job_id: JobId(id),
        kind,
        status,
        progress,
        message,
        created_at: chrono::Utc::now(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut conn = Connection::open(&cli.socket).await?;

    let req = match cli.command {
        Commands::Watch { id } => return watch(&mut conn, JobId(id)).await,
        Commands::Audit { max_queued, max_processing, format } => {
            return audit(&mut conn, max_queued, max_processing, format).await
        }
        Commands::Status { id } => Request::GetStatus(JobId(id)),
        Commands::Unwatch { id } => Request::Unwatch(JobId(id)),
        Commands::List => Request::ListWatched,
        Commands::Emit { id, step, status, progress, message } => {
            Request::PublishEvent(event(id, EventKind::from_step(&step), status, progress, message))
        }
        Commands::Heartbeat { id, status, progress } => {
            Request::PublishEvent(event(id, EventKind::Heartbeat, status, progress, None))
        }
    };

    match conn.call(&req).await? {
        Response::Ok => println!("Success"),
        Response::Error(e) => eprintln!("Error: {}", e),
        Response::Status(Some(status)) => print_status(&status),
        Response::Status(None) => println!("No status yet."),
        Response::Watched(ids) => {
            if ids.is_empty() {
                println!("No jobs watched.");
            }
            for id in ids {
                println!("{}", id);
            }
        }
        Response::Audit(outcome) => print_audit(&outcome, Format::Table)?,
    }

    Ok(())
}

async fn watch(conn: &mut Connection, job_id: JobId) -> anyhow::Result<()> {
    conn.send(&Request::Watch(job_id)).await?;
    loop {
        match conn.recv().await? {
            Response::Status(Some(status)) => print_status_line(&status),
            Response::Status(None) => {}
            Response::Ok => return Ok(()),
            Response::Error(e) => bail!(e),
            other => bail!("Unexpected response: {:?}", other),
        }
    }
}

async fn audit(
    conn: &mut Connection,
    max_queued_min: Option<i64>,
    max_processing_min: Option<i64>,
    format: Format,
) -> anyhow::Result<()> {
    let req = Request::Audit { max_queued_min, max_processing_min };
    match conn.call(&req).await? {
        Response::Audit(outcome) => {
            print_audit(&outcome, format)?;
            if !outcome.is_ok() {
                std::process::exit(1);
            }
            Ok(())
        }
        Response::Error(e) => bail!(e),
        other => bail!("Unexpected response: {:?}", other),
    }
}

fn print_status(status: &DerivedStatus) {
    println!("Job Status:");
    println!("  ID:       {}", status.job_id);
    println!("  State:    {}", status.state);
    println!("  Step:     {}", status.step.as_deref().unwrap_or("-"));
    println!("  Progress: {:.0}%", status.progress);
    println!("  Message:  {}", status.message.as_deref().unwrap_or("-"));
    println!("  Updated:  {}", status.last_update.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
}

fn print_status_line(status: &DerivedStatus) {
    println!(
        "[{}] {:<16} {:<20} {:>5.1}% {}",
        status.last_update.with_timezone(&chrono::Local).format("%H:%M:%S"),
        status.state,
        status.step.as_deref().unwrap_or("-"),
        status.progress,
        status.message.as_deref().unwrap_or("")
    );
}

fn print_audit(outcome: &AuditOutcome, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        Format::Csv => match outcome {
            AuditOutcome::Completed(report) => write_csv(report)?,
            AuditOutcome::Failed(f) => eprintln!("Error: {}", f.error),
        },
        Format::Table => match outcome {
            AuditOutcome::Completed(report) => print_report(report),
            AuditOutcome::Failed(f) => eprintln!("Audit failed: {}", f.error),
        },
    }
    Ok(())
}

fn write_csv(report: &AuditReport) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(std::io::stdout());
    wtr.write_record(["id", "status", "age_min", "reason"])?;
    for s in &report.suspects {
        let age = s.age_min.map(|a| a.to_string()).unwrap_or_default();
        wtr.write_record([s.id.as_str(), s.status.as_str(), age.as_str(), s.reason.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

fn print_report(report: &AuditReport) {
    let mut counts = Table::new();
    counts.load_preset(UTF8_FULL).set_header(vec!["Status", "Jobs"]);
    for (status, n) in &report.counts {
        counts.add_row(vec![status.clone(), n.to_string()]);
    }
    println!("{counts}");

    if report.ok {
        println!("OK: no suspect jobs.");
        return;
    }

    let mut suspects = Table::new();
    suspects
        .load_preset(UTF8_FULL)
        .set_header(vec!["Job ID", "Status", "Age (min)", "Reason"]);
    for s in &report.suspects {
        let age = s.age_min.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
        suspects.add_row(vec![s.id.clone(), s.status.clone(), age, s.reason.clone()]);
    }
    println!("{suspects}");

    println!("Suggestions:");
    for suggestion in &report.suggestions {
        println!("  - {}", suggestion);
    }
}
