//! Compare-and-swap advancement of a branch tip.
//!
//! The conditional `UPDATE ... WHERE id = ? AND version = ?` is the whole
//! concurrency primitive. Nothing is locked between reading a version and
//! issuing the update.

use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::persistence::Store;

/// Move `branch_id`'s tip to `new_tip` if its version is still
/// `expected_version`, returning the new version (`expected_version + 1`).
///
/// On a stale version the branch is re-read and the actual tip and version
/// are returned inside [`GraphError::TipMoved`]; the caller decides whether
/// to retry.
pub fn advance_tip(
    store: &Store<'_>,
    branch_id: &str,
    expected_version: i64,
    new_tip: Option<&str>,
) -> GraphResult<i64> {
    let changed = store.compare_and_set_tip(branch_id, expected_version, new_tip)?;
    if changed == 1 {
        debug!(branch_id, expected_version, new_tip = ?new_tip, "advanced branch tip");
        return Ok(expected_version + 1);
    }

    match store.get_branch(branch_id)? {
        Some(current) => {
            warn!(
                branch_id,
                expected_version,
                current_version = current.version,
                "branch tip moved"
            );
            Err(GraphError::TipMoved {
                branch_id: branch_id.to_string(),
                current_tip: current.tip_node_id,
                current_version: current.version,
            })
        }
        None => Err(GraphError::not_found("branch", branch_id)),
    }
}
