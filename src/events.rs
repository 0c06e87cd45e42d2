// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

/// What kind of event is being reported
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// Structural damage was found in the database
    Failure,

    /// Damage was found and repaired
    DbRepair,
}

/// Caller-supplied sink for noteworthy database events.
///
/// This is for operator-visible anomalies (a corrupt version list that was
/// deleted, a repaired index); routine diagnostics go through the `log`
/// crate instead.
pub trait EventLogger: Send + Sync {
    /// Reports one event.
    fn log(&self, kind: EventKind, message: &str);
}

/// Discards all events.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullEventLogger;

impl EventLogger for NullEventLogger {
    fn log(&self, _kind: EventKind, _message: &str) {}
}
