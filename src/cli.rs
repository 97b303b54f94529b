use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(version)]
#[command(about = "Compare documents and chat about the differences with a DocSync backend")]
pub struct Args {
    /// TOML config file (defaults to ./docsync.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Upload one or two files (old, new) for comparison
    Process {
        #[arg(required = true, num_args = 1..=2)]
        files: Vec<PathBuf>,
    },

    /// Ask a question about the processed files and stream the answer
    Chat {
        question: String,

        /// Restrict the question to one processed file ("All" for every file)
        #[arg(long, short)]
        file: Option<String>,
    },

    /// Print the persisted chat transcript
    History,

    /// Clear the chat transcript
    Clear,

    /// Download a report for the last comparison
    Report {
        /// Where to write the report (defaults to <id>_report.txt)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List downloaded reports
    Reports {
        /// Forget every recorded report
        #[arg(long)]
        clear: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_minimal() {
        let args = Args::parse_from(["docsync", "chat", "What changed?"]);
        assert_eq!(
            args.command,
            Command::Chat { question: "What changed?".to_string(), file: None }
        );
        assert!(args.config.is_none());
    }

    #[test]
    fn test_parse_chat_with_file_and_config() {
        let args = Args::parse_from([
            "docsync",
            "chat",
            "Summarize",
            "--file",
            "report.pdf",
            "--config",
            "alt.toml",
        ]);
        assert_eq!(
            args.command,
            Command::Chat { question: "Summarize".to_string(), file: Some("report.pdf".to_string()) }
        );
        assert_eq!(args.config, Some(PathBuf::from("alt.toml")));
    }

    #[test]
    fn test_parse_process_two_files() {
        let args = Args::parse_from(["docsync", "process", "old.pdf", "new.pdf"]);
        assert_eq!(
            args.command,
            Command::Process { files: vec![PathBuf::from("old.pdf"), PathBuf::from("new.pdf")] }
        );
    }

    #[test]
    fn test_parse_process_rejects_three_files() {
        assert!(Args::try_parse_from(["docsync", "process", "a", "b", "c"]).is_err());
    }

    #[test]
    fn test_parse_process_requires_a_file() {
        assert!(Args::try_parse_from(["docsync", "process"]).is_err());
    }

    #[test]
    fn test_parse_report_output() {
        let args = Args::parse_from(["docsync", "report", "-o", "out.txt"]);
        assert_eq!(args.command, Command::Report { output: Some(PathBuf::from("out.txt")) });
    }

    #[test]
    fn test_parse_reports_clear() {
        let args = Args::parse_from(["docsync", "reports", "--clear"]);
        assert_eq!(args.command, Command::Reports { clear: true });
    }
}
