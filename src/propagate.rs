//! Outbound propagation contract toward persistence and replication
//!
//! The server core never writes files or talks to replicas; every effect
//! that must outlive the process or reach a replica goes through this
//! narrow hook. The default sink discards everything, which is also the
//! behavior when both targets are disabled.

/// Propagation targets, combinable.
pub const PROPAGATE_NONE: u8 = 0;
pub const PROPAGATE_PERSIST_LOG: u8 = 1 << 0;
pub const PROPAGATE_REPLICAS: u8 = 1 << 1;
pub const PROPAGATE_ALL: u8 = PROPAGATE_PERSIST_LOG | PROPAGATE_REPLICAS;

pub trait Propagator {
    /// Forward one executed command (already rewritten to its canonical
    /// argv) for the given database.
    fn propagate(&mut self, db_id: usize, argv: &[Vec<u8>], targets: u8);

    /// Append a raw protocol fragment to the replication backlog.
    fn feed_backlog(&mut self, bytes: &[u8]);

    /// Downcast hook so callers can reach a concrete sink (tests inspect
    /// the recording one).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Discards everything; the stand-in when no sink is configured.
#[derive(Debug, Default)]
pub struct NullPropagator;

impl Propagator for NullPropagator {
    fn propagate(&mut self, _db_id: usize, _argv: &[Vec<u8>], _targets: u8) {}

    fn feed_backlog(&mut self, _bytes: &[u8]) {}

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Records every propagated command; test instrumentation.
#[derive(Debug, Default)]
pub struct RecordingPropagator {
    pub commands: Vec<(usize, Vec<Vec<u8>>, u8)>,
    pub backlog: Vec<u8>,
}

impl Propagator for RecordingPropagator {
    fn propagate(&mut self, db_id: usize, argv: &[Vec<u8>], targets: u8) {
        self.commands.push((db_id, argv.to_vec(), targets));
    }

    fn feed_backlog(&mut self, bytes: &[u8]) {
        self.backlog.extend_from_slice(bytes);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
