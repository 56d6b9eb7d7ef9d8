//! Network namespace context for host provisioning.
//!
//! Host changes must be made in the host's network namespace. The calling
//! thread may have been moved into a container namespace by someone else,
//! so every provisioning sequence runs inside a [`NamespaceGuard`] that puts
//! the thread in the host namespace and moves it back when dropped.
#![allow(unsafe_code)]

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use keel_common::{KeelError, KeelResult};

/// Namespace of the init process, taken as the host namespace.
const HOST_NETNS: &str = "/proc/1/ns/net";

/// Namespace of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Switches the calling thread into the namespace host changes are made in.
pub trait OsContext: Send + Sync {
    /// Enter the namespace until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Fails if the namespace cannot be opened or entered.
    fn enter(&self) -> KeelResult<NamespaceGuard>;
}

/// Restores the previous namespace of the thread on drop.
#[derive(Debug)]
#[must_use = "the namespace is restored when the guard is dropped"]
pub struct NamespaceGuard {
    previous: Option<File>,
}

impl NamespaceGuard {
    /// A guard with nothing to restore.
    pub const fn noop() -> Self {
        Self { previous: None }
    }

    /// Whether dropping the guard switches namespaces.
    #[must_use]
    pub const fn switched(&self) -> bool {
        self.previous.is_some()
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = setns(&previous) {
                tracing::error!(error = %e, "Failed to restore network namespace");
            }
        }
    }
}

/// Runs provisioning in the init process's network namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostNamespace;

impl OsContext for HostNamespace {
    fn enter(&self) -> KeelResult<NamespaceGuard> {
        let host = File::open(HOST_NETNS)?;
        let current = File::open(THREAD_NETNS)?;

        let (h, c) = (host.metadata()?, current.metadata()?);
        if h.dev() == c.dev() && h.ino() == c.ino() {
            return Ok(NamespaceGuard::noop());
        }

        tracing::debug!(ino = h.ino(), "Entering host network namespace");
        setns(&host)?;
        Ok(NamespaceGuard {
            previous: Some(current),
        })
    }
}

/// Runs provisioning wherever the thread already is.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentNamespace;

impl OsContext for CurrentNamespace {
    fn enter(&self) -> KeelResult<NamespaceGuard> {
        Ok(NamespaceGuard::noop())
    }
}

#[cfg(target_os = "linux")]
fn setns(ns: &File) -> KeelResult<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
    if result < 0 {
        return Err(KeelError::internal(format!(
            "setns failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn setns(_ns: &File) -> KeelResult<()> {
    Err(KeelError::internal(
        "network namespaces are only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_namespace_never_switches() {
        let guard = CurrentNamespace.enter().unwrap();
        assert!(!guard.switched());
    }
}
