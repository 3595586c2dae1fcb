//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::arena::MAX_CAPACITY;

/// ExamHall - teacher/student exam over shared memory
#[derive(Parser)]
#[command(
    name = "exam",
    about = "Teacher/student exam coordination over shared memory and named semaphores",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the teacher (creates the exam, grades students until interrupted)
    Teacher {
        /// Number of slots
        #[arg(value_parser = clap::value_parser!(u32).range(1..=MAX_CAPACITY as i64))]
        capacity: u32,

        /// End the exam after this many students were processed
        #[arg(short, long)]
        max_students: Option<usize>,
    },

    /// Run one student attempt
    Student,

    /// Spawn several student processes and wait for them
    Cohort {
        /// Number of students
        #[arg(value_parser = clap::value_parser!(u32).range(1..=MAX_CAPACITY as i64 * 4))]
        size: u32,

        /// Delay between spawns
        #[arg(short, long, default_value = "0")]
        stagger_ms: u64,
    },

    /// Print every line broadcast on the log FIFO
    Observer {
        /// Prefix each line with the local time
        #[arg(short, long)]
        timestamps: bool,
    },

    /// Show the slot table of the running exam
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

impl Command {
    /// Prefix of this command's log file name
    pub fn log_name(&self) -> &'static str {
        match self {
            Self::Teacher { .. } => "teacher",
            Self::Student => "student",
            Self::Cohort { .. } => "cohort",
            Self::Observer { .. } => "observer",
            Self::Status { .. } => "status",
        }
    }
}

/// Get the log file path for a command and process
pub fn get_log_path(name: &str, pid: u32) -> PathBuf {
    debug!(name, pid, "get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("examhall")
        .join("logs")
        .join(format!("{}-{}.log", name, pid))
}

/// Output format for the status command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_teacher_capacity_bounds() {
        assert!(Cli::try_parse_from(["exam", "teacher", "3"]).is_ok());
        assert!(Cli::try_parse_from(["exam", "teacher", "0"]).is_err());
        assert!(Cli::try_parse_from(["exam", "teacher", "1025"]).is_err());

        let cli = Cli::try_parse_from(["exam", "teacher", "1024", "--max-students", "5"]).unwrap();
        match cli.command {
            Command::Teacher { capacity, max_students } => {
                assert_eq!(capacity, 1024);
                assert_eq!(max_students, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_status_format() {
        let cli = Cli::try_parse_from(["exam", "status", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Command::Status { format: OutputFormat::Json }));
        assert!(Cli::try_parse_from(["exam", "status", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_log_path_per_command() {
        let path = get_log_path("student", 42);
        assert!(path.ends_with("examhall/logs/student-42.log"));

        let status = Cli::try_parse_from(["exam", "status"]).unwrap();
        assert_eq!(status.command.log_name(), "status");
        let teacher = Cli::try_parse_from(["exam", "teacher", "3"]).unwrap();
        assert_eq!(teacher.command.log_name(), "teacher");
        let cohort = Cli::try_parse_from(["exam", "cohort", "2"]).unwrap();
        assert_eq!(cohort.command.log_name(), "cohort");
    }
}
