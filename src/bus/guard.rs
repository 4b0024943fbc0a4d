//! Scoped ownership of a bus connection.

use std::ops::Deref;

use crate::{log_debug, log_warn, Bus, BusPtr, Result};

/// Owns a bus connection and closes it exactly once.
///
/// Call [`release`](BusGuard::release) on the normal exit path: it flushes
/// (a failed flush is only logged) and then closes. A guard dropped without
/// being released still closes the bus, on a background task, when a Tokio
/// runtime is available.
pub struct BusGuard {
    bus: BusPtr,
    released: bool,
}

impl BusGuard {
    pub fn new(bus: BusPtr) -> Self {
        Self {
            bus,
            released: false,
        }
    }

    /// Shared pointer to the guarded bus.
    pub fn bus(&self) -> BusPtr {
        self.bus.clone()
    }

    /// Flush, then close.
    pub async fn release(mut self) -> Result<()> {
        // ---
        self.released = true;

        if let Err(err) = self.bus.flush().await {
            log_warn!("{}: flush failed: {err}", self.bus.bus_id());
        }
        self.bus.close().await
    }
}

impl Deref for BusGuard {
    type Target = dyn Bus;

    fn deref(&self) -> &Self::Target {
        self.bus.as_ref()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        // ---
        if self.released {
            return;
        }

        let bus = self.bus.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            log_debug!("{}: closing unreleased bus", bus.bus_id());
            runtime.spawn(async move {
                if let Err(err) = bus.flush().await {
                    log_warn!("{}: flush failed: {err}", bus.bus_id());
                }
                if let Err(err) = bus.close().await {
                    log_warn!("{}: close failed: {err}", bus.bus_id());
                }
            });
        }
    }
}
