use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use docsync_chat::api::ReportRecord;
use docsync_chat::cli::{Args, Command};
use docsync_chat::config::ClientConfig;
use docsync_chat::persistence::{self, SqliteStorage, Storage};
use docsync_chat::render::{self, StreamPrinter};
use docsync_chat::transport::report_unavailable;
use docsync_chat::{now_ms, open_session, ChatError, HttpTransport, SendOutcome};

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ClientConfig::load(args.config.as_deref())?;
    init_tracing(&config.log_filter);

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&config.state_db)?);
    let transport = Arc::new(HttpTransport::new(&config)?);

    match args.command {
        Command::Process { files } => {
            let result = transport.process_files(&files).await.map_err(|e| {
                eprintln!(
                    "{}",
                    "Failed to process files. Please check backend and file types.".bright_red()
                );
                e
            })?;
            persistence::save_comparison(storage.as_ref(), &result)?;
            render::print_comparison(&result);
        }

        Command::Chat { question, file } => {
            let comparison = persistence::load_comparison(storage.as_ref())?.ok_or_else(|| {
                ChatError::InvalidInput("no processed comparison; run `docsync process` first".to_string())
            })?;
            let filter = comparison.context_filter(file.as_deref())?;
            let session = open_session(transport, Arc::clone(&storage));
            chat(&session, &question, filter.as_deref()).await?;
        }

        Command::History => {
            let session = open_session(transport, storage);
            render::print_transcript(&session.snapshot());
        }

        Command::Clear => {
            let session = open_session(transport, storage);
            session.clear();
            println!("{}", "Chat history cleared.".bright_green());
        }

        Command::Report { output } => {
            let payload = transport.fetch_report().await.map_err(|e| {
                if report_unavailable(&e) {
                    eprintln!(
                        "{}",
                        "No last comparison found. Please run `docsync process` first."
                            .bright_red()
                    );
                }
                e
            })?;
            let id = uuid::Uuid::new_v4().simple().to_string()[..7].to_string();
            let path = output.unwrap_or_else(|| PathBuf::from(format!("{id}_report.txt")));
            tokio::fs::write(&path, &payload).await?;

            let files = persistence::load_comparison(storage.as_ref())?
                .map(|c| c.file_names.join(", "))
                .unwrap_or_default();
            let record = ReportRecord {
                id,
                title: if files.is_empty() {
                    "Report".to_string()
                } else {
                    format!("Report • {files}")
                },
                summary: "Report generated from backend.".to_string(),
                created_at: now_ms(),
                blob_reference: path.display().to_string(),
            };
            info!(path = %record.blob_reference, bytes = payload.len(), "report saved");
            let reports = persistence::prepend_report(storage.as_ref(), record)?;
            render::print_reports(&reports[..1]);
        }

        Command::Reports { clear } => {
            if clear {
                persistence::clear_reports(storage.as_ref())?;
            }
            render::print_reports(&persistence::load_reports(storage.as_ref()));
        }
    }

    Ok(())
}

/// Send one question, printing the answer as it streams. Ctrl-C cancels the
/// stream and keeps what has arrived.
async fn chat(
    session: &docsync_chat::ChatSession,
    question: &str,
    filter: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = session.subscribe();
    let mut printer = StreamPrinter::new();

    let send = session.send(question, filter);
    tokio::pin!(send);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome?,
            Some(event) = events.recv() => printer.handle(&event),
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                session.cancel();
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.handle(&event);
    }

    match outcome {
        SendOutcome::Completed { .. } => {}
        SendOutcome::Failed { error, .. } => {
            eprintln!("{} {}", "Chat failed:".bright_red(), error);
        }
        SendOutcome::Cancelled { .. } => {
            eprintln!("{}", "Stream cancelled.".bright_yellow());
        }
    }
    Ok(())
}
