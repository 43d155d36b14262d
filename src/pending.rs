use crate::Error;
use dashmap::{DashMap, Entry};
use rmpv::Value;
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) type CallOutcome = Result<Value, Error>;

/// Outstanding local calls keyed by msgid.
///
/// Each entry is removed exactly once: by the matching response, by
/// [`fail_all`](Self::fail_all) when the endpoint stops, or by the
/// [`PendingGuard`] of a call that gave up waiting.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<u32, oneshot::Sender<CallOutcome>, ahash::RandomState>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `msgid`.
    ///
    /// Fails if a call with the same id is still waiting; the counter has
    /// wrapped all the way around onto it.
    pub(crate) fn register(
        &self,
        msgid: u32,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<CallOutcome>), Error> {
        match self.calls.entry(msgid) {
            Entry::Occupied(_) => Err(Error::MsgIdCollision(msgid)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok((
                    PendingGuard {
                        table: self,
                        msgid,
                        armed: true,
                    },
                    rx,
                ))
            }
        }
    }

    /// Deliver the outcome for `msgid`. Returns false if nobody is waiting.
    pub(crate) fn complete(&self, msgid: u32, outcome: CallOutcome) -> bool {
        match self.calls.remove(&msgid) {
            Some((_, tx)) => {
                // The receiver may have been dropped in the meantime; that's fine.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve every outstanding call with `err`.
    pub(crate) fn fail_all(&self, err: &Error) {
        let msgids: Vec<u32> = self.calls.iter().map(|entry| *entry.key()).collect();
        if !msgids.is_empty() {
            debug!(count = msgids.len(), error = %err, "failing pending calls");
        }
        for msgid in msgids {
            self.complete(msgid, Err(err.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    fn forget(&self, msgid: u32) {
        self.calls.remove(&msgid);
    }
}

/// Removes a pending entry when the owning call returns early or is dropped.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingCalls,
    msgid: u32,
    armed: bool,
}

impl PendingGuard<'_> {
    pub(crate) fn msgid(&self) -> u32 {
        self.msgid
    }

    /// The entry has been resolved by someone else; nothing left to clean up.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.forget(self.msgid);
        }
    }
}
