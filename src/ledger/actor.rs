//! Ledger actor: owns the store and applies commands one at a time.

use super::{ImportSummary, LedgerRecord, LedgerStore, PendingFilter, RecordUpdate, StatusCounts};
use crate::error::PersistenceError;
use crate::types::{IdentityId, Item, ItemId};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, PersistenceError>>;

/// Messages accepted by the ledger actor
pub(super) enum LedgerCommand {
    Load {
        reply: Reply<Vec<LedgerRecord>>,
    },
    Get {
        id: ItemId,
        reply: Reply<Option<LedgerRecord>>,
    },
    PendingPage {
        filter: PendingFilter,
        after: i64,
        limit: u32,
        reply: Reply<Vec<LedgerRecord>>,
    },
    Record {
        update: Box<RecordUpdate>,
        reply: Reply<LedgerRecord>,
    },
    Import {
        items: Vec<Item>,
        reply: Reply<ImportSummary>,
    },
    Counts {
        reply: Reply<StatusCounts>,
    },
    Failed {
        reply: Reply<Vec<LedgerRecord>>,
    },
    UsageSince {
        since: i64,
        reply: Reply<HashMap<IdentityId, u32>>,
    },
    ResetFailed {
        reply: Reply<u64>,
    },
    Close {
        reply: Reply<()>,
    },
}

pub(super) struct LedgerActor {
    store: LedgerStore,
    receiver: mpsc::Receiver<LedgerCommand>,
}

impl LedgerActor {
    pub(super) fn new(store: LedgerStore, receiver: mpsc::Receiver<LedgerCommand>) -> Self {
        Self { store, receiver }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!("ledger actor started");

        while let Some(command) = self.receiver.recv().await {
            // Replies are dropped silently if the caller went away
            match command {
                LedgerCommand::Load { reply } => {
                    let _ = reply.send(self.store.load().await);
                }
                LedgerCommand::Get { id, reply } => {
                    let _ = reply.send(self.store.get(&id).await);
                }
                LedgerCommand::PendingPage {
                    filter,
                    after,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(self.store.pending_page(&filter, after, limit).await);
                }
                LedgerCommand::Record { update, reply } => {
                    let result = self.store.record(&update).await;
                    if let Err(e) = &result {
                        tracing::error!(item_id = %update.item.id, error = %e, "ledger write failed");
                    }
                    let _ = reply.send(result);
                }
                LedgerCommand::Import { items, reply } => {
                    let _ = reply.send(self.store.import(&items).await);
                }
                LedgerCommand::Counts { reply } => {
                    let _ = reply.send(self.store.counts().await);
                }
                LedgerCommand::Failed { reply } => {
                    let _ = reply.send(self.store.failed().await);
                }
                LedgerCommand::UsageSince { since, reply } => {
                    let _ = reply.send(self.store.usage_since(since).await);
                }
                LedgerCommand::ResetFailed { reply } => {
                    let _ = reply.send(self.store.reset_failed().await);
                }
                LedgerCommand::Close { reply } => {
                    let result = self.store.set_clean_shutdown().await;
                    self.receiver.close();
                    // Drain what was queued before the close so no caller hangs
                    while let Some(pending) = self.receiver.recv().await {
                        reject(pending);
                    }
                    self.store.close().await;
                    let _ = reply.send(result);
                    tracing::debug!("ledger actor stopped");
                    return;
                }
            }
        }

        // Every handle dropped without close(): leave the unclean flag set
        self.store.close().await;
        tracing::debug!("ledger actor stopped without clean shutdown");
    }
}

fn stopped<T>() -> Result<T, PersistenceError> {
    Err(PersistenceError::WriterStopped)
}

fn reject(command: LedgerCommand) {
    match command {
        LedgerCommand::Load { reply } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Get { reply, .. } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::PendingPage { reply, .. } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Record { reply, .. } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Import { reply, .. } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Counts { reply } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Failed { reply } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::UsageSince { reply, .. } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::ResetFailed { reply } => {
            let _ = reply.send(stopped());
        }
        LedgerCommand::Close { reply } => {
            let _ = reply.send(Ok(()));
        }
    }
}
