//! Log observer: prints every broadcast line it manages to catch

use std::future::Future;
use std::path::Path;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tracing::debug;

use crate::logsink::ensure_fifo;

/// Read lines from the log FIFO until `stop` resolves
///
/// The FIFO is opened read-write so that writers coming and going never
/// produce end-of-file. It is left in place on exit so observers and
/// teachers can be restarted independently.
pub async fn watch<F, S>(fifo: &Path, mut on_line: F, stop: S) -> Result<usize>
where
    F: FnMut(&str),
    S: Future<Output = ()>,
{
    ensure_fifo(fifo).with_context(|| format!("Failed to create FIFO {}", fifo.display()))?;

    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(fifo)
        .with_context(|| format!("Failed to open FIFO {}", fifo.display()))?;
    let mut lines = BufReader::new(receiver).lines();
    debug!(?fifo, "watch: listening");

    tokio::pin!(stop);
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!(seen, "watch: stop requested");
                break;
            }
            line = lines.next_line() => {
                match line.context("Failed to read from FIFO")? {
                    Some(line) => {
                        seen += 1;
                        on_line(&line);
                    }
                    None => break,
                }
            }
        }
    }
    Ok(seen)
}
