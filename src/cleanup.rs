//! Retention sweeps: expired messages, orphan delivery rows, idle devices.
//!
//! Runs daily as a detached task. Every step is idempotent — a rerun on a
//! clean database is a no-op — and blob deletion failures are logged rather
//! than fatal so a flaky object store cannot wedge the sweep.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::logging::now_ms;
use crate::rlog;
use crate::web::state::SharedState;

/// Devices unseen for this long are garbage-collected.
pub const DEVICE_IDLE_MS: i64 = 90 * 24 * 60 * 60 * 1000;

/// Blobs younger than this are never treated as orphans; an in-flight send
/// sits between blob write and metadata insert for at most seconds.
const ORPHAN_BLOB_GRACE_MS: i64 = 60 * 60 * 1000;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub messages_deleted: usize,
    pub blobs_deleted: usize,
    pub orphan_blobs_deleted: usize,
    pub orphan_deliveries_deleted: usize,
    pub devices_deleted: usize,
}

/// One full sweep at time `now`.
pub async fn run_cleanup(state: &SharedState, now: i64) -> CleanupReport {
    let mut report = CleanupReport::default();

    let (expired, blobs) = {
        let st = state.lock().await;
        let expired = match st.storage.expired_messages(now) {
            Ok(expired) => expired,
            Err(e) => {
                rlog!(Error, "cleanup: expired-message query failed: {e}");
                return report;
            }
        };
        (expired, st.blobs.clone())
    };

    // Blobs first so a metadata row never outlives its object silently; a
    // failed blob delete leaves the row for the next sweep.
    let mut deletable = Vec::with_capacity(expired.len());
    for (message_id, blob_key) in expired {
        if let Some(blob_key) = blob_key {
            match blobs.delete(&blob_key) {
                Ok(()) => report.blobs_deleted += 1,
                Err(e) => {
                    rlog!(Warn, "cleanup: blob delete {blob_key} failed: {e}");
                    continue;
                }
            }
        }
        deletable.push(message_id);
    }

    {
        let st = state.lock().await;
        for message_id in deletable {
            match st.storage.delete_message(&message_id) {
                Ok(true) => report.messages_deleted += 1,
                Ok(false) => {}
                Err(e) => rlog!(Warn, "cleanup: delete of {message_id} failed: {e}"),
            }
        }
        match st.storage.delete_orphan_deliveries() {
            Ok(count) => report.orphan_deliveries_deleted = count,
            Err(e) => rlog!(Warn, "cleanup: orphan delivery sweep failed: {e}"),
        }
        match st.storage.delete_idle_devices(now - DEVICE_IDLE_MS) {
            Ok(count) => report.devices_deleted = count,
            Err(e) => rlog!(Warn, "cleanup: idle device sweep failed: {e}"),
        }
    }

    // Orphan blobs: objects whose metadata row never landed (a send that
    // died between blob write and insert). The grace window spares sends
    // still in flight.
    let keys = match blobs.list("messages") {
        Ok(keys) => keys,
        Err(e) => {
            rlog!(Warn, "cleanup: blob listing failed: {e}");
            Vec::new()
        }
    };
    let mut candidates = Vec::new();
    for key in keys {
        let Ok(meta) = blobs.metadata(&key) else {
            continue;
        };
        if now - meta.uploaded_at >= ORPHAN_BLOB_GRACE_MS {
            candidates.push((key, meta.message_id));
        }
    }
    if !candidates.is_empty() {
        let orphans = {
            let st = state.lock().await;
            let mut orphans = Vec::new();
            for (key, message_id) in candidates {
                match st.storage.message_exists(&message_id) {
                    Ok(false) => orphans.push(key),
                    Ok(true) => {}
                    Err(e) => rlog!(Warn, "cleanup: orphan check for {key} failed: {e}"),
                }
            }
            orphans
        };
        for key in orphans {
            match blobs.delete(&key) {
                Ok(()) => report.orphan_blobs_deleted += 1,
                Err(e) => rlog!(Warn, "cleanup: orphan blob delete {key} failed: {e}"),
            }
        }
    }

    if report != CleanupReport::default() {
        rlog!(
            Info,
            "cleanup: removed {} messages, {} blobs, {} orphan blobs, {} orphan deliveries, {} idle devices",
            report.messages_deleted,
            report.blobs_deleted,
            report.orphan_blobs_deleted,
            report.orphan_deliveries_deleted,
            report.devices_deleted
        );
    }
    report
}

/// Spawn the daily sweep. The task owns its errors and stops only on the
/// shutdown signal.
pub fn start_cleanup_task(state: SharedState, mut shutdown_rx: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_cleanup(&state, now_ms()).await;
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }
    });
}
