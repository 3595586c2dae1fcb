//! The context every protocol operation runs against

use crate::arena::SharedArena;
use crate::logsink::LogSink;

/// An attached arena plus the participant's log sink
///
/// Constructed when a participant creates or attaches the arena and torn
/// down with it; there is no process-global state.
#[derive(Debug)]
pub struct Session {
    arena: SharedArena,
    sink: LogSink,
}

impl Session {
    pub fn new(arena: SharedArena, sink: LogSink) -> Self {
        Self { arena, sink }
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.sink.emit(message);
    }
}
