//! Background scheduler for the catalog manager.
//!
//! One spawned loop drives the assignment pipeline and token-signing-key
//! rotation while this master leads the system tablet. Handlers wake it
//! early when they stage work (new tablets to create, dropped tablets to
//! clean up); otherwise it ticks at the configured interval.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogManager;
use crate::error::CatalogError;

pub(crate) struct BgTasks {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl BgTasks {
    pub(crate) fn spawn(catalog: Arc<CatalogManager>) -> Self {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let join = tokio::spawn(run(catalog, cancel.clone(), Arc::clone(&wake)));
        Self { cancel, wake, join: Mutex::new(Some(join)) }
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        self.wake.notify_one();
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        tracing::debug!("catalog manager background task loop shut down");
    }
}

async fn run(catalog: Arc<CatalogManager>, cancel: CancellationToken, wake: Arc<Notify>) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match catalog.leader_shared() {
            Err(CatalogError::NotInitialized(msg)) => {
                tracing::info!("waiting for catalog manager background task loop to start: {msg}");
            }
            Err(err) => {
                tracing::debug!(error = %err, "catalog manager background task loop going to sleep");
            }
            Ok(leader) => {
                let to_process = catalog.extract_tablets_to_process();
                if !to_process.is_empty() {
                    // Errors (e.g. leadership loss mid-pass) leave the
                    // tablets for the next wakeup.
                    if let Err(err) = catalog.process_pending_assignments(to_process).await {
                        tracing::error!(error = %err, "error processing pending assignments");
                    }
                }

                if let Err(err) = catalog.try_generate_new_tsk().await {
                    if catalog.has_term_changed(leader.term()) {
                        tracing::info!(
                            error = %err,
                            "failed to refresh token signing key; ignoring since not the leader anymore"
                        );
                    } else if catalog.signer.is_current_key_valid() {
                        tracing::warn!(
                            error = %err,
                            "failed to refresh token signing key; will try again next cycle"
                        );
                    } else {
                        // A healthy leader with no valid signing key cannot
                        // mint tokens; there is no way to keep running
                        // consistently.
                        tracing::error!(
                            error = %err,
                            "failed to refresh token signing key and no valid key remains"
                        );
                        std::process::exit(1);
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(catalog.config.bg_task_interval) => {}
        }
    }
    tracing::debug!("catalog manager background task loop exiting");
}
