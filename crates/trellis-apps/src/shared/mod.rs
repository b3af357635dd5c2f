//! Decides whether an app launches its own process or joins one another
//! invocation already published, and who is responsible for tearing it down.


use tracing::{debug, info, warn};

use crate::cache::{ReattachDescriptor, ReattachStore};
use crate::error::{CacheError, HostError};
use crate::process;

const SHARED_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shared");

/// How an app should obtain its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Join the process described by this descriptor.
    Reattach(ReattachDescriptor),
    /// Start a new process.
    Launch,
}

/// Responsibility an app instance holds for its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Launched a shared host and published it; tears both down.
    Owner,
    /// Joined a shared host another invocation owns; only disconnects.
    Guest,
    /// Launched a process nobody else uses; tears it down.
    Private,
}

impl Ownership {
    /// Whether this instance owns a shared process and its published
    /// descriptor.
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Owner)
    }

    /// Whether tearing this instance down stops the process.
    #[must_use]
    pub const fn stops_process(self) -> bool {
        matches!(self, Self::Owner | Self::Private)
    }

    /// Whether the process is shared between invocations.
    #[must_use]
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::Owner | Self::Guest)
    }
}

/// Coordinates shared hosts through the reattachment cache.
#[derive(Debug, Clone)]
pub struct SharedHostCoordinator {
    store: ReattachStore,
}

impl SharedHostCoordinator {
    /// Coordinates through `store`.
    #[must_use]
    pub const fn new(store: ReattachStore) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &ReattachStore {
        &self.store
    }

    /// Looks up a published host for `reference`.
    ///
    /// # Errors
    ///
    /// Fails when the cache cannot be read.
    pub fn plan(&self, reference: &str) -> Result<Attachment, CacheError> {
        match self.store.read(reference)? {
            Some(descriptor) => {
                debug!(
                    target: SHARED_TARGET,
                    reference,
                    pid = descriptor.pid,
                    "found published host"
                );
                Ok(Attachment::Reattach(descriptor))
            }
            None => Ok(Attachment::Launch),
        }
    }

    /// Decides the ownership role once the manifest is known, publishing
    /// `descriptor` when this instance becomes the owner.
    ///
    /// A reattached instance is always a guest: it did not start the
    /// process and must never stop it.
    ///
    /// # Errors
    ///
    /// Fails when publishing the descriptor fails.
    pub fn settle(
        &self,
        reference: &str,
        attachment: &Attachment,
        shared: bool,
        descriptor: &ReattachDescriptor,
    ) -> Result<Ownership, CacheError> {
        match (attachment, shared) {
            (Attachment::Reattach(_), _) => Ok(Ownership::Guest),
            (Attachment::Launch, false) => Ok(Ownership::Private),
            (Attachment::Launch, true) => {
                self.store.write(reference, descriptor)?;
                info!(
                    target: SHARED_TARGET,
                    reference,
                    pid = descriptor.pid,
                    endpoint = %descriptor.endpoint,
                    "published shared host"
                );
                Ok(Ownership::Owner)
            }
        }
    }

    /// Withdraws the descriptor `pid` published when `role` is the owner.
    /// An entry naming another process is left alone.
    ///
    /// # Errors
    ///
    /// Fails when the cache cannot be updated.
    pub fn release(&self, reference: &str, role: Ownership, pid: u32) -> Result<(), CacheError> {
        if !role.is_host() {
            return Ok(());
        }
        if self.store.remove_published(reference, pid)? {
            debug!(target: SHARED_TARGET, reference, pid, "withdrew shared host");
        }
        Ok(())
    }

    /// Handles a failed reattachment. When the recorded process is
    /// verifiably gone the entry is cleared and `Ok(())` tells the caller to
    /// launch instead; otherwise the failure becomes a stale-descriptor
    /// error and the entry is kept.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::StaleDescriptor`] when the owner may still be
    /// alive, or when clearing the entry fails.
    pub fn clear_stale(
        &self,
        reference: &str,
        descriptor: &ReattachDescriptor,
        failure: &HostError,
    ) -> Result<(), HostError> {
        let stale = |reason: String| HostError::StaleDescriptor {
            pid: descriptor.pid,
            endpoint: descriptor.endpoint.to_string(),
            reason,
        };
        if process::is_alive(descriptor.pid) != Some(false) {
            warn!(
                target: SHARED_TARGET,
                reference,
                pid = descriptor.pid,
                error = %failure,
                "published host unreachable but may still be running"
            );
            return Err(stale(failure.to_string()));
        }
        self.store
            .remove_published(reference, descriptor.pid)
            .map_err(|error| stale(format!("{failure}; clearing entry failed: {error}")))?;
        info!(
            target: SHARED_TARGET,
            reference,
            pid = descriptor.pid,
            "cleared descriptor of exited host"
        );
        Ok(())
    }
}
