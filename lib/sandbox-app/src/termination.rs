//! Termination requests.
//!
//! The supervisor never deals with OS signals directly. It waits on a [`TerminationRequest`], which can be backed by
//! real signal handlers, by a [`TerminationHandle`] held by the caller, or by any arbitrary future.

use std::{
    future::{pending, Future},
    pin::Pin,
};

use sandbox_error::{ErrorContext as _, GenericError};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::oneshot,
};
use tracing::info;

/// A pending request to terminate the sandbox.
pub struct TerminationRequest {
    requested: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// A handle to trigger a paired [`TerminationRequest`].
pub struct TerminationHandle {
    terminate_tx: oneshot::Sender<()>,
}

impl TerminationRequest {
    /// Creates a new `TerminationRequest` and `TerminationHandle` pair.
    ///
    /// The request resolves when the handle is triggered or dropped.
    pub fn paired() -> (Self, TerminationHandle) {
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let request = Self {
            requested: Some(Box::pin(async move {
                let _ = terminate_rx.await;
            })),
        };

        (request, TerminationHandle { terminate_tx })
    }

    /// Creates a new `TerminationRequest` that resolves once `future` resolves.
    pub fn wrapped<F: Future + Send + 'static>(future: F) -> Self {
        Self {
            requested: Some(Box::pin(async move {
                future.await;
            })),
        }
    }

    /// Creates a new `TerminationRequest` that never resolves.
    pub fn never() -> Self {
        Self {
            requested: Some(Box::pin(pending::<()>())),
        }
    }

    /// Creates a new `TerminationRequest` that resolves on the first SIGINT or SIGTERM delivered to this process.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the signal handlers cannot be registered, an error is returned.
    pub fn from_os_signals() -> Result<Self, GenericError> {
        let mut sigint_handler = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
        let mut sigterm_handler = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

        Ok(Self::wrapped(async move {
            select! {
                _ = sigint_handler.recv() => info!("Received SIGINT, shutting down..."),
                _ = sigterm_handler.recv() => info!("Received SIGTERM, shutting down..."),
            }
        }))
    }

    /// Waits until termination is requested.
    ///
    /// Once the request has been observed, subsequent calls return immediately.
    pub async fn wait(&mut self) {
        if let Some(requested) = self.requested.as_mut() {
            requested.await;
            self.requested = None;
        }
    }

    /// Returns `true` if the request was already observed by [`wait`][Self::wait].
    pub fn is_observed(&self) -> bool {
        self.requested.is_none()
    }
}

impl TerminationHandle {
    /// Requests termination.
    pub fn trigger(self) {
        let _ = self.terminate_tx.send(());
    }
}
