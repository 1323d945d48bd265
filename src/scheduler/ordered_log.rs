//! Strict iteration-order log emission
//!
//! Every iteration owns one link of a chain of one-shot signals. A link
//! flushes its queued log closures only after the previous link released,
//! then releases the next one. Work may finish in any order; log output
//! cannot.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Deferred log side effect
pub type LogFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LinkState {
    queued: Vec<LogFn>,
    submitted: bool,
    released: bool,
    prev: Option<oneshot::Receiver<()>>,
    next: Option<oneshot::Sender<()>>,
}

/// One iteration's position in the ordering chain
pub struct OrderedLink {
    index: u64,
    state: Mutex<LinkState>,
}

impl std::fmt::Debug for OrderedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OrderedLink")
            .field("index", &self.index)
            .field("queued", &state.queued.len())
            .field("submitted", &state.submitted)
            .field("released", &state.released)
            .finish()
    }
}

impl OrderedLink {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Emit `log` in iteration order: immediately if this link already
    /// released, otherwise once it does
    pub fn log(&self, log: LogFn) {
        let mut state = self.state.lock();
        if state.released {
            drop(state);
            log();
        } else {
            state.queued.push(log);
        }
    }

    /// This iteration is ready to emit. Idempotent.
    pub fn mark_submitted(self: &Arc<Self>) {
        let prev = {
            let mut state = self.state.lock();
            if state.submitted {
                return;
            }
            state.submitted = true;
            state.prev.take()
        };

        let link = self.clone();
        let flush = async move {
            if let Some(prev) = prev {
                // A dropped sender means the previous link is gone
                let _ = prev.await;
            }
            link.flush();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(flush);
            }
            // Outside a runtime the order can no longer be awaited
            Err(_) => self.flush(),
        }
    }

    fn flush(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.queued.is_empty() {
                    state.released = true;
                    if let Some(next) = state.next.take() {
                        let _ = next.send(());
                    }
                    return;
                }
                std::mem::take(&mut state.queued)
            };
            for log in batch {
                log();
            }
        }
    }
}

/// Hands out chain links in iteration order
#[derive(Debug, Default)]
pub struct OrderedChain {
    tail: Option<oneshot::Receiver<()>>,
    next_index: u64,
}

impl OrderedChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link for the next iteration
    pub fn next_link(&mut self) -> Arc<OrderedLink> {
        let (tx, rx) = oneshot::channel();
        let link = Arc::new(OrderedLink {
            index: self.next_index,
            state: Mutex::new(LinkState {
                prev: self.tail.replace(rx),
                next: Some(tx),
                ..Default::default()
            }),
        });
        self.next_index += 1;
        link
    }

    /// Wait until every link handed out so far has released
    pub async fn drain(self) {
        if let Some(tail) = self.tail {
            let _ = tail.await;
        }
    }
}
