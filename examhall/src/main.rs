//! ExamHall - teacher/student exam coordination
//!
//! CLI entry point for the teacher, students, observers and status checks.

use std::fs;
use std::path::Path;
use std::process;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use examhall::cli::{Cli, Command, OutputFormat, get_log_path};
use examhall::config::Config;
use examhall::logsink::{LogSink, Role, ensure_fifo};
use examhall::observer;
use examhall::{
    ArenaSnapshot, Coordinator, CoordinatorConfig, RandomGrader, SharedArena, SlotState, Student, StudentConfig,
};

fn setup_logging(log_name: &str, cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path(log_name, process::id());
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(
        cli.command.log_name(),
        cli.log_level.as_deref(),
        config_log_level.as_deref(),
    )
    .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Teacher { capacity, max_students } => cmd_teacher(&config, capacity, max_students).await,
        Command::Student => cmd_student(&config).await,
        Command::Cohort { size, stagger_ms } => {
            cmd_cohort(cli.config.as_deref(), size, Duration::from_millis(stagger_ms)).await
        }
        Command::Observer { timestamps } => cmd_observer(&config, timestamps).await,
        Command::Status { format } => cmd_status(&config, format),
    }
}

fn broadcast_sink(config: &Config, role: Role) -> LogSink {
    if let Err(e) = ensure_fifo(&config.names.log_fifo) {
        warn!(fifo = %config.names.log_fifo.display(), error = %e, "Log FIFO unavailable");
    }
    LogSink::new(role, process::id(), &config.names.log_fifo)
}

async fn cmd_teacher(config: &Config, capacity: u32, max_students: Option<usize>) -> Result<()> {
    debug!(capacity, ?max_students, "cmd_teacher: called");
    let names = config.names()?;
    let grader = RandomGrader::new(config.timing.grading_range(), config.exam.grades());
    let coordinator_config = CoordinatorConfig::from_timing(&config.timing).with_max_students(max_students);

    let coordinator = Coordinator::create(
        &names,
        capacity,
        broadcast_sink(config, Role::Teacher),
        grader,
        coordinator_config,
    )
    .context("Failed to start the exam")?;
    let handle = coordinator.shutdown_handle();

    let mut worker = tokio::task::spawn_blocking(move || {
        let mut coordinator = coordinator;
        let run = coordinator.run();
        let teardown = coordinator.teardown();
        (run, teardown)
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (run, teardown) = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received - shutting down exam");
                handle.request();
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received - shutting down exam");
                handle.request();
            }
            result = &mut worker => break result.context("Teacher task panicked")?,
        }
    };

    let summary = run.context("Grading loop failed")?;
    let teardown = teardown.context("Teardown failed")?;
    info!(
        processed = summary.processed,
        notified = summary.shutdown.notified.len(),
        swept = teardown.swept.len(),
        "Teacher exited"
    );
    Ok(())
}

async fn cmd_student(config: &Config) -> Result<()> {
    debug!("cmd_student: called");
    let names = config.names()?;
    let sink = broadcast_sink(config, Role::Student);

    let student = match Student::attach(&names, sink.clone(), StudentConfig::from_config(config)) {
        Ok(student) => student,
        Err(e) if e.is_not_found() => {
            sink.emit("Teacher not running");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to join the exam"),
    };

    let interrupt = student.interrupt_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received - withdrawing");
            interrupt.request();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || student.run())
        .await
        .context("Student task panicked")?
        .context("Exam attempt failed")?;
    debug!(?outcome, "cmd_student: done");
    Ok(())
}

async fn cmd_cohort(config_path: Option<&Path>, size: u32, stagger: Duration) -> Result<()> {
    debug!(size, ?stagger, "cmd_cohort: called");
    let exe = std::env::current_exe().context("Failed to locate current executable")?;

    let mut children = Vec::with_capacity(size as usize);
    for i in 0..size {
        let mut cmd = tokio::process::Command::new(&exe);
        if let Some(path) = config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("student");
        let child = cmd.spawn().with_context(|| format!("Failed to spawn student {}", i))?;
        debug!(i, pid = ?child.id(), "cmd_cohort: spawned student");
        children.push(child);
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }
    }

    let mut failed = 0usize;
    for mut child in children {
        let status = child.wait().await.context("Failed to wait for student")?;
        if !status.success() {
            failed += 1;
        }
    }

    if failed == 0 {
        println!("{} {} students finished", "✓".green(), size);
    } else {
        println!("{} {} of {} students failed", "✗".red(), failed, size);
    }
    info!(size, failed, "Cohort finished");
    Ok(())
}

async fn cmd_observer(config: &Config, timestamps: bool) -> Result<()> {
    let pid = process::id();
    let fifo = &config.names.log_fifo;
    println!("[Observer {}] Watching {}", pid, fifo.display());

    let seen = observer::watch(
        fifo,
        |line| {
            if timestamps {
                let now = chrono::Local::now().format("%H:%M:%S%.3f");
                println!("{} [Observer {}] {}", now, pid, line);
            } else {
                println!("[Observer {}] {}", pid, line);
            }
        },
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await?;

    println!("[Observer {}] Exiting after {} lines", pid, seen);
    Ok(())
}

fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_status: called");
    let names = config.names()?;
    let arena = match SharedArena::attach(&names) {
        Ok(arena) => arena,
        Err(e) if e.is_not_found() => {
            println!("{} Teacher not running", "✗".red());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to attach to exam"),
    };
    let snapshot = arena
        .with_table_lock(|table| table.snapshot())?
        .context("Failed to read slot table")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Text => print_snapshot(names.namespace(), &snapshot),
    }
    Ok(())
}

fn print_snapshot(namespace: &str, snapshot: &ArenaSnapshot) {
    let state = if snapshot.shutting_down {
        "shutting down".yellow()
    } else {
        "running".green()
    };
    println!(
        "Exam '{}': {} ({}/{} slots occupied)",
        namespace, state, snapshot.active_count, snapshot.capacity
    );

    for slot in snapshot.occupied() {
        let label = match slot.state {
            SlotState::Waiting => slot.state.to_string().cyan(),
            SlotState::Processing => slot.state.to_string().yellow(),
            _ => slot.state.to_string().red(),
        };
        println!(
            "  slot {:>4}  {:<10}  student {:<8}  ticket {}",
            slot.index, label, slot.owner, slot.ticket
        );
    }
}
