//! Cooperative cancellation for long-running validation work.
//!
//! A [`CancellationSource`] owns a flag; every [`CancellationToken`] handed
//! out by it observes that flag. Tokens can be joined so that work is
//! interrupted when any of several sources (e.g. node shutdown and a
//! per-request deadline) fires. Cancelling is sticky.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct CancellationSource {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            sources: vec![Arc::clone(&self.cancelled)],
        }
    }
}

/// Read side of one or more cancellation sources. The default token is
/// never cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    sources: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.sources.iter().any(|flag| flag.load(Ordering::Acquire))
    }

    /// A token cancelled as soon as either input token is.
    pub fn join(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
        let mut sources = Vec::with_capacity(a.sources.len() + b.sources.len());
        sources.extend(a.sources.iter().cloned());
        sources.extend(b.sources.iter().cloned());
        CancellationToken { sources }
    }
}
