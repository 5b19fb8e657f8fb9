use system::Revision;

use crate::config::PersistenceConfig;
use crate::gateway::{AuthorizationOracle, DocumentStatus, GatewayError, PersistenceGateway};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(Revision),
    /// Nothing changed since the last save.
    UpToDate,
    /// The document can no longer be written; the edits are discarded.
    Skipped(DocumentStatus),
    Failed { attempts: u32 },
}

/// Writes the session's raster back if it changed since the last save.
///
/// Saves of one session never overlap. Failed writes are retried with
/// exponential backoff up to `config.max_attempts`.
pub async fn persist(
    gateway: &dyn PersistenceGateway,
    oracle: &dyn AuthorizationOracle,
    config: &PersistenceConfig,
    session: &Session,
) -> SaveOutcome {
    let _guard = session.save_lock().lock().await;
    let document_id = session.document_id();
    let snapshot = session.snapshot();
    let revision = snapshot.revision();
    if revision <= session.persisted_revision() {
        return SaveOutcome::UpToDate;
    }

    match oracle.document_status(document_id).await {
        Ok(DocumentStatus::Active) => {}
        Ok(status) => {
            log::info!(
                "Discarding revision {} of {}: document is {:?}",
                revision,
                document_id,
                status
            );
            session.mark_persisted(revision);
            return SaveOutcome::Skipped(status);
        }
        // The gateway refuses non-active documents on its own.
        Err(e) => log::warn!("Status check for {} failed before save: {}", document_id, e),
    }

    let mut attempt = 1;
    loop {
        match gateway.save_raster(document_id, &snapshot).await {
            Ok(()) => {
                session.mark_persisted(revision);
                log::info!("Saved {} at revision {}", document_id, revision);
                return SaveOutcome::Saved(revision);
            }
            Err(GatewayError::NotWritable(status)) => {
                log::info!(
                    "Discarding revision {} of {}: document is {:?}",
                    revision,
                    document_id,
                    status
                );
                session.mark_persisted(revision);
                return SaveOutcome::Skipped(status);
            }
            Err(e) if attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                log::warn!(
                    "Saving {} failed (attempt {}/{}), retrying in {:?}: {}",
                    document_id,
                    attempt,
                    config.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!(
                    "Giving up on saving {} at revision {} after {} attempts: {}",
                    document_id,
                    revision,
                    attempt,
                    e
                );
                return SaveOutcome::Failed { attempts: attempt };
            }
        }
    }
}
