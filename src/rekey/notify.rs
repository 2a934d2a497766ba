use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use serde::Serialize;

use super::monitor::LifecycleState;
use crate::{rekey_error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub raid_group: u32,
    pub lifecycle: LifecycleState,
}

struct Registration {
    raid_group: u32,
    lifecycle: LifecycleState,
    tx: Sender<Notification>,
}

/// Delivers lifecycle transitions to whoever registered for them. A
/// registration fires once, on the first matching transition after it was
/// made, and is then dropped.
#[derive(Clone, Default)]
pub struct NotificationService {
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl NotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, raid_group: u32, lifecycle: LifecycleState) -> Receiver<Notification> {
        let (tx, rx) = channel();
        match self.registrations.lock() {
            Ok(mut registrations) => registrations.push(Registration {
                raid_group,
                lifecycle,
                tx,
            }),
            Err(e) => error!("Notification registry poisoned: {e}"),
        }
        rx
    }

    pub fn emit(&self, raid_group: u32, lifecycle: LifecycleState) {
        let Ok(mut registrations) = self.registrations.lock() else {
            error!("Notification registry poisoned, dropping {lifecycle:?} for rg {raid_group}");
            return;
        };
        let notification = Notification {
            raid_group,
            lifecycle,
        };
        registrations.retain(|r| {
            if r.raid_group != raid_group || r.lifecycle != lifecycle {
                return true;
            }
            if r.tx.send(notification).is_err() {
                debug!("Listener for rg {raid_group} {lifecycle:?} went away");
            }
            false
        });
    }

    pub fn pending(&self) -> usize {
        self.registrations.lock().map(|r| r.len()).unwrap_or(0)
    }
}

/// Waits for a registered notification.
pub fn wait_for_notification(rx: &Receiver<Notification>, timeout: Duration) -> Result<Notification> {
    rx.recv_timeout(timeout).map_err(|e| {
        rekey_error!(ChannelError {
            reason: format!("no notification within {timeout:?}: {e}"),
        })
    })
}
