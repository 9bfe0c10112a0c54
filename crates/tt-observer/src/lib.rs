//! Observer side of thread-tracker: scans a thread source and reports full
//! snapshots to the hub, re-emitting on context changes and rescan requests.

pub mod debounce;
#[cfg(unix)]
pub mod runtime;
pub mod source;

pub use debounce::Debouncer;
#[cfg(unix)]
pub use runtime::{EmitError, Emitter, Observer, ObserverConfig, ObserverEvent, ObserverHandle};
pub use source::{sample_threads, JsonFileSource, SourceError, StaticSource, ThreadSource};
