//! Best-effort log broadcast
//!
//! Every participant writes human-readable lines `[<ROLE> <id>] <message>` to
//! a FIFO that observers may (or may not) be reading. Writes never block and
//! never fail the writer: no reader, a full pipe or a broken pipe all drop the
//! line.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info};

/// Who is speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
    Observer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Teacher => write!(f, "TEACHER"),
            Self::Student => write!(f, "STUDENT"),
            Self::Observer => write!(f, "OBSERVER"),
        }
    }
}

/// Fire-and-forget line writer
#[derive(Debug, Clone)]
pub struct LogSink {
    role: Role,
    id: u32,
    fifo: Option<PathBuf>,
    echo: bool,
}

impl LogSink {
    /// Broadcast through `fifo` and echo to stdout
    pub fn new(role: Role, id: u32, fifo: impl Into<PathBuf>) -> Self {
        Self {
            role,
            id,
            fifo: Some(fifo.into()),
            echo: true,
        }
    }

    /// Only trace; nothing is printed or broadcast
    pub fn disabled(role: Role, id: u32) -> Self {
        Self {
            role,
            id,
            fifo: None,
            echo: false,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn format_line(&self, message: &str) -> String {
        format!("[{} {}] {}", self.role, self.id, message)
    }

    /// Emit one line; never blocks, never fails
    pub fn emit(&self, message: impl AsRef<str>) {
        let line = self.format_line(message.as_ref());
        info!(role = %self.role, id = self.id, "{}", message.as_ref());
        if self.echo {
            println!("{}", line);
        }
        if let Some(fifo) = &self.fifo {
            send(fifo, &line);
        }
    }
}

fn send(fifo: &Path, line: &str) {
    // O_NONBLOCK on a FIFO without reader fails with ENXIO instead of blocking
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo);
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            debug!(?fifo, error = %e, "log sink: no reader, dropping line");
            return;
        }
    };

    let mut payload = String::with_capacity(line.len() + 1);
    payload.push_str(line);
    payload.push('\n');
    // Writes up to PIPE_BUF are atomic, so a line is delivered whole or not at all
    if let Err(e) = file.write(payload.as_bytes()) {
        debug!(?fifo, error = %e, "log sink: write dropped");
    }
}

/// Create the FIFO if it does not exist yet
pub fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_format_line() {
        let sink = LogSink::disabled(Role::Student, 4242);
        assert_eq!(sink.format_line("Registered in slot 0"), "[STUDENT 4242] Registered in slot 0");
        assert_eq!(LogSink::disabled(Role::Teacher, 1).format_line("x"), "[TEACHER 1] x");
    }

    #[test]
    fn test_emit_without_reader_does_not_block_or_fail() {
        let temp = TempDir::new().unwrap();
        let fifo = temp.path().join("log");
        ensure_fifo(&fifo).unwrap();

        let sink = LogSink::new(Role::Teacher, 1, &fifo).with_echo(false);
        sink.emit("nobody is listening");
    }

    #[test]
    fn test_emit_to_missing_path_is_dropped() {
        let temp = TempDir::new().unwrap();
        let sink = LogSink::new(Role::Teacher, 1, temp.path().join("absent")).with_echo(false);
        sink.emit("dropped");
        assert!(!temp.path().join("absent").exists());
    }

    #[test]
    fn test_emit_reaches_reader() {
        let temp = TempDir::new().unwrap();
        let fifo = temp.path().join("log");
        ensure_fifo(&fifo).unwrap();

        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo)
            .unwrap();

        let sink = LogSink::new(Role::Student, 7, &fifo).with_echo(false);
        sink.emit("Received grade: 5");

        let mut buf = String::new();
        reader.read_to_string(&mut buf).ok();
        assert_eq!(buf, "[STUDENT 7] Received grade: 5\n");
    }

    #[test]
    fn test_ensure_fifo_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let fifo = temp.path().join("log");
        ensure_fifo(&fifo).unwrap();
        ensure_fifo(&fifo).unwrap();
    }
}
