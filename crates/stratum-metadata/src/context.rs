//! Per-call resolution context: cancellation and progress reporting.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared flag asking running resolutions to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress events emitted during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A node's static layers were loaded and its reactors ran once.
    NodeInitialized { node: String },
    /// A reactor returned output.
    ReactorRan {
        node: String,
        reactor: String,
        changed: bool,
    },
    /// Metadata settled.
    Finished { iterations: usize },
}

type ProgressFn = dyn Fn(&Progress) + Send + Sync;

/// Context passed to every resolution call.
#[derive(Clone, Default)]
pub struct ResolveContext {
    cancel: CancellationToken,
    progress: Option<Arc<ProgressFn>>,
}

impl ResolveContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails with [`Error::Cancelled`] once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn report(&self, event: Progress) {
        if let Some(callback) = &self.progress {
            callback(&event);
        }
    }
}

impl fmt::Debug for ResolveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
