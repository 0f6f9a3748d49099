//! Lifecycle tracking, log fan-in and process-tree termination for the
//! child processes devrun supervises.

pub mod events;
pub mod multiplexer;
pub mod process;
pub mod project;
pub mod shutdown;

pub use events::{apply_event, SupervisorEvent, EVENT_QUEUE_CAPACITY};
pub use multiplexer::{pump, LineWriter, StreamSink, TeeWriter};
pub use process::{spawn_shell, ProcessHandle};
pub use project::{DetectedUrl, Project, LOG_CAPACITY};
pub use shutdown::{graceful_shutdown, graceful_shutdown_within, ShutdownReport, SHUTDOWN_TIMEOUT};
