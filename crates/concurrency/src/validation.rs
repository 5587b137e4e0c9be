//! Read-log validation
//!
//! Conflict detection at commit time. Rules:
//! - Every logged read must still carry the version it was read at
//! - A logged location whose record is locked by another thread is invalid,
//!   since that thread may be installing a new value right now
//! - A record locked by the validating thread itself is fine: locking keeps
//!   the version, so the version comparison still applies
//! - Blind writes (written, never read) are not validated
//!
//! Validation stops at the first conflict; one is enough to abort.

use crate::orec::OrecTable;
use crate::transaction::ReadEntry;
use stm_core::{ConflictKind, ThreadId};

/// Validate a read log against the current ownership records
///
/// # Arguments
/// * `read_log` - locations read with the versions observed at read time
/// * `orecs` - ownership-record table to check against
/// * `me` - the validating thread, whose own locks are ignored
///
/// Returns the first conflict found, or `None` if every read is still current.
pub fn validate_read_log(
    read_log: &[ReadEntry],
    orecs: &OrecTable,
    me: ThreadId,
) -> Option<ConflictKind> {
    for entry in read_log {
        let record = orecs.for_addr(entry.addr);
        let snapshot = record.snapshot();
        if record.is_locked_by_other(snapshot, me) || snapshot.version() != entry.version {
            return Some(ConflictKind::ValidationFailed {
                addr: entry.addr,
                observed: entry.version,
                current: snapshot.version(),
            });
        }
    }
    None
}
