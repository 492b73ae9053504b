//! The per-environment append-only sequenced event log: the system's sole
//! coordination primitive and its observability backbone (spec §4.1).

pub mod event;
pub mod log;

pub use event::{
    CallbackRequest, CallbackResponse, ConnectionObserved, DiagnosticSnapshot, Event, EventType,
    GrpcCallObserved, LogLine, LogStream, RequestObserved, ServiceDiagnostic,
};
pub use log::{EventLog, Predicate};
