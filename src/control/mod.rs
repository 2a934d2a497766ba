//! Admin surface of the rekey engine: a worker pool that owns the raid
//! group monitors and a cloneable handle that talks to it.

mod scheduler;

use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use log::debug;

pub use scheduler::{AdminRequest, Scheduler};

use crate::rekey::{MonitorParams, PeerLink, RekeyStatus, RgEvent};
use crate::{rekey_error, Result};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle for administrative requests. Each request is routed to
/// the worker owning the raid group and answered once the worker has seen
/// it.
#[derive(Clone)]
pub struct AdminControl {
    workers: Vec<Sender<AdminRequest>>,
}

impl AdminControl {
    fn new(workers: Vec<Sender<AdminRequest>>) -> Self {
        AdminControl { workers }
    }

    fn worker(&self, raid_group: u32) -> Result<&Sender<AdminRequest>> {
        if self.workers.is_empty() {
            return Err(rekey_error!(ChannelError {
                reason: "scheduler has no workers".to_string(),
            }));
        }
        Ok(&self.workers[raid_group as usize % self.workers.len()])
    }

    fn request<T>(&self, raid_group: u32, make: impl FnOnce(Sender<Result<T>>) -> AdminRequest) -> Result<T> {
        let (reply, rx): (Sender<Result<T>>, Receiver<Result<T>>) = channel();
        self.worker(raid_group)?.send(make(reply))?;
        rx.recv_timeout(REPLY_TIMEOUT)?
    }

    /// Hands a raid group to its worker, which builds the monitor.
    pub fn add_group(&self, params: MonitorParams) -> Result<()> {
        let raid_group = params.raid_group;
        self.request(raid_group, |reply| AdminRequest::AddGroup {
            params: Box::new(params),
            reply,
        })
    }

    pub fn send_event(&self, raid_group: u32, event: RgEvent) -> Result<()> {
        debug!("rg {raid_group}: admin event {event:?}");
        self.request(raid_group, |reply| AdminRequest::Event {
            raid_group,
            event,
            reply,
        })
    }

    pub fn attach_peer(&self, raid_group: u32, link: PeerLink) -> Result<()> {
        self.request(raid_group, |reply| AdminRequest::AttachPeer {
            raid_group,
            link,
            reply,
        })
    }

    pub fn start_rekey(&self, raid_group: u32) -> Result<()> {
        self.send_event(raid_group, RgEvent::StartRekey)
    }

    pub fn pause_rekey(&self, raid_group: u32) -> Result<()> {
        self.send_event(raid_group, RgEvent::PauseRekey)
    }

    pub fn resume_rekey(&self, raid_group: u32) -> Result<()> {
        self.send_event(raid_group, RgEvent::ResumeRekey)
    }

    pub fn get_rekey_status(&self, raid_group: u32) -> Result<RekeyStatus> {
        self.request(raid_group, |reply| AdminRequest::Status { raid_group, reply })
    }

    /// Polls the status until `done` holds or `timeout` passes.
    pub fn wait_for_status(
        &self,
        raid_group: u32,
        timeout: Duration,
        done: impl Fn(&RekeyStatus) -> bool,
    ) -> Result<RekeyStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_rekey_status(raid_group)?;
            if done(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(rekey_error!(ChannelError {
                    reason: format!("rg {raid_group} still {:?} after {timeout:?}", status.substate),
                }));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
