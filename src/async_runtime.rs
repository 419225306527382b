//! The process-wide tokio runtime.
//!
//! Endpoint workers and the VBDP poller run on a shared multi-threaded
//! runtime that outlives every device instance. It is initialized once at
//! startup; tests that need it can call [`init_runtime`] as well and
//! ignore the "already initialized" error.

use anyhow::{anyhow, Context, Result};
use std::sync::OnceLock;
use tokio::runtime::Handle;

static RUNTIME_HANDLE: OnceLock<Handle> = OnceLock::new();

/// The shared runtime handle.
///
/// # Panics
///
/// Panics when [`init_runtime`] has not run yet.
pub fn runtime() -> &'static Handle {
    RUNTIME_HANDLE.get().expect("runtime not initialized")
}

/// Build the runtime and publish its handle.
pub fn init_runtime() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    RUNTIME_HANDLE
        .set(rt.handle().clone())
        .map_err(|_| anyhow!("runtime already initialized"))?;

    // Keep the runtime alive for the rest of the process.
    std::mem::forget(rt);

    Ok(())
}
