//! VBus-Drop bookkeeping for guest S3 suspend/resume.
//!
//! When the guest saves controller state (USBCMD.CSS), every emulated
//! port is snapshotted into a record in state `Start`. While a record is
//! in `Start`, connect events for its device path are cached instead of
//! being reported, and its virtual port is held in reserve. When the
//! guest tears the slot down during resume (Disable Slot), the record
//! moves to `End` and the poller replays the connect event on the
//! recorded virtual port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::constants::xhci::MAX_NATIVE_PORTS;
use super::ports::DevicePath;
use super::xhci::XhciController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdpState {
    None,
    Start,
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct VbdpRecord {
    pub path: DevicePath,
    pub vport: u8,
    pub state: VbdpState,
}

/// The table of suspend/resume records.
#[derive(Debug)]
pub struct VbdpTracker {
    records: [VbdpRecord; MAX_NATIVE_PORTS],
    /// Number of records currently in flight (`Start` or `End`).
    active: usize,
}

impl VbdpTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: [VbdpRecord {
                path: DevicePath::default(),
                vport: 0,
                state: VbdpState::None,
            }; MAX_NATIVE_PORTS],
            active: 0,
        }
    }

    /// Forget all records; called when a new save-state cycle begins.
    pub fn clear(&mut self) {
        for record in &mut self.records {
            record.state = VbdpState::None;
            record.vport = 0;
            record.path = DevicePath::default();
        }
        self.active = 0;
    }

    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    /// Snapshot a device that is being suspended.
    pub fn record_start(&mut self, path: DevicePath, vport: u8) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.state == VbdpState::None)
        {
            *record = VbdpRecord {
                path,
                vport,
                state: VbdpState::Start,
            };
            self.active += 1;
            info!("s3: saved state of {path} on virtual port {vport}");
        }
    }

    /// Whether a connect/disconnect for `path` is part of an in-progress
    /// suspend cycle.
    #[must_use]
    pub fn is_start(&self, path: &DevicePath) -> bool {
        self.active > 0
            && self
                .records
                .iter()
                .any(|r| r.state == VbdpState::Start && r.path == *path)
    }

    /// The virtual port recorded for a suspended device.
    #[must_use]
    pub fn start_vport(&self, path: &DevicePath) -> Option<u8> {
        self.records
            .iter()
            .find(|r| r.state == VbdpState::Start && r.path == *path)
            .map(|r| r.vport)
    }

    /// Whether any in-flight record holds this virtual port in reserve.
    #[must_use]
    pub fn reserves_vport(&self, vport: u8) -> bool {
        self.active > 0
            && self
                .records
                .iter()
                .any(|r| r.state == VbdpState::Start && r.vport == vport)
    }

    /// Move the record for `path` from `Start` to `End`.
    ///
    /// Returns true when a record transitioned; the caller then posts the
    /// poller.
    pub fn mark_end(&mut self, path: &DevicePath) -> bool {
        let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.state == VbdpState::Start && r.path == *path)
        else {
            return false;
        };
        record.state = VbdpState::End;
        debug!("s3: slot released, device {path} may reconnect");
        true
    }

    /// Take the next record in state `End`, resetting it to `None`.
    pub fn take_end(&mut self) -> Option<VbdpRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.state == VbdpState::End)?;
        let taken = *record;
        record.state = VbdpState::None;
        self.active = self.active.saturating_sub(1);
        Some(taken)
    }
}

impl Default for VbdpTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakeup channel between the controller and the poller task.
#[derive(Debug)]
pub struct VbdpSignal {
    permits: Semaphore,
    shutdown: AtomicBool,
}

impl VbdpSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Wake the poller once.
    pub fn post(&self) {
        self.permits.add_permits(1);
    }

    /// Ask the poller to exit; the final post wakes it up for the check.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.permits.add_permits(1);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wait for a post. Returns false when shutdown was requested.
    pub async fn wait(&self) -> bool {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = self.permits.acquire().await.unwrap();
        permit.forget();
        !self.is_shutdown()
    }
}

impl Default for VbdpSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the VBDP poller until shutdown.
///
/// A single long-lived task: it blocks on the signal, then drains one
/// `End` record under the controller lock, replaying the deferred connect
/// event.
pub async fn run_poller(controller: Weak<Mutex<XhciController>>, signal: Arc<VbdpSignal>) {
    while signal.wait().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.lock().unwrap().vbdp_poll_once();
    }
    debug!("vbdp poller exits");
}
