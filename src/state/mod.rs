//! Append-only ledger of job progress.
//!
//! Records are never edited or removed. The snapshot is a fold over the
//! records, so replaying the log after a crash rebuilds exactly the state
//! that existed when the last record was durably written.

pub mod record;
pub mod snapshot;
pub mod store;

pub use record::{RecordKind, RecordedOutcome, StateRecord};
pub use snapshot::{AttemptSummary, CommittedWave, PhaseState, Snapshot};
pub use store::{StateStore, replay};
