//! Coordinator side of thread-tracker: merges observer snapshots into the
//! authoritative thread collection, derives stall status, raises alerts and
//! serves observers and viewers over a local socket.

pub mod coordinator;
pub mod notifier;
pub mod server;

pub use coordinator::{Coordinator, CoordinatorError, MergeReport, Transition, TransitionKind};
pub use notifier::{
    AlertDescriptor, AlertSurface, DeliveryError, DesktopAlertSurface, MemoryAlertSurface,
    Notifier, NotifyOutcome,
};
pub use server::{run, HubConfig};
