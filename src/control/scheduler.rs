use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::rekey::{Action, MonitorParams, PeerLink, RekeyMonitor, RekeyStatus, RgEvent};
use crate::{rekey_error, Result};

/// How long a worker sleeps when a monitor is waiting on I/O or a drain.
const WAIT_POLL: Duration = Duration::from_micros(200);
/// How long a worker sleeps when every monitor is idle. Passive monitors
/// still need periodic steps to notice peer traffic.
const IDLE_POLL: Duration = Duration::from_millis(5);

pub enum AdminRequest {
    AddGroup {
        params: Box<MonitorParams>,
        reply: Sender<Result<()>>,
    },
    Event {
        raid_group: u32,
        event: RgEvent,
        reply: Sender<Result<()>>,
    },
    AttachPeer {
        raid_group: u32,
        link: PeerLink,
        reply: Sender<Result<()>>,
    },
    Status {
        raid_group: u32,
        reply: Sender<Result<RekeyStatus>>,
    },
    Shutdown,
}

struct Slot {
    monitor: RekeyMonitor,
    events: Vec<RgEvent>,
    last: Action,
}

/// Owns the monitors of the raid groups pinned to one worker thread.
struct Worker {
    index: usize,
    receiver: Receiver<AdminRequest>,
    slots: BTreeMap<u32, Slot>,
    done: bool,
}

impl Worker {
    fn new(index: usize, receiver: Receiver<AdminRequest>) -> Self {
        Worker {
            index,
            receiver,
            slots: BTreeMap::new(),
            done: false,
        }
    }

    fn handle_request(&mut self, request: AdminRequest) {
        match request {
            AdminRequest::AddGroup { params, reply } => {
                let raid_group = params.raid_group;
                let result = if self.slots.contains_key(&raid_group) {
                    Err(rekey_error!(InvalidParameter {
                        description: format!("raid group {raid_group} already scheduled"),
                    }))
                } else {
                    RekeyMonitor::new(*params).map(|monitor| {
                        self.slots.insert(
                            raid_group,
                            Slot {
                                monitor,
                                events: Vec::new(),
                                last: Action::Continue,
                            },
                        );
                    })
                };
                if let Err(e) = &result {
                    error!("Worker {}: could not add raid group {raid_group}: {e}", self.index);
                }
                let _ = reply.send(result);
            }
            AdminRequest::Event {
                raid_group,
                event,
                reply,
            } => {
                let result = match self.slots.get_mut(&raid_group) {
                    Some(slot) => {
                        slot.events.push(event);
                        slot.last = Action::Continue;
                        Ok(())
                    }
                    None => Err(rekey_error!(NotFound { raid_group })),
                };
                let _ = reply.send(result);
            }
            AdminRequest::AttachPeer {
                raid_group,
                link,
                reply,
            } => {
                let result = match self.slots.get_mut(&raid_group) {
                    Some(slot) => {
                        slot.monitor.attach_peer(link);
                        slot.last = Action::Continue;
                        Ok(())
                    }
                    None => Err(rekey_error!(NotFound { raid_group })),
                };
                let _ = reply.send(result);
            }
            AdminRequest::Status { raid_group, reply } => {
                let result = self
                    .slots
                    .get(&raid_group)
                    .map(|slot| slot.monitor.status())
                    .ok_or_else(|| rekey_error!(NotFound { raid_group }));
                let _ = reply.send(result);
            }
            AdminRequest::Shutdown => {
                info!("Worker {} shutting down", self.index);
                self.done = true;
            }
        }
    }

    fn receive_requests(&mut self, block_for: Option<Duration>) {
        if let Some(timeout) = block_for {
            match self.receiver.recv_timeout(timeout) {
                Ok(request) => self.handle_request(request),
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Worker {}: admin channel closed", self.index);
                    self.done = true;
                    return;
                }
            }
        }
        while let Ok(request) = self.receiver.try_recv() {
            self.handle_request(request);
        }
    }

    /// Steps every monitor once and reports the most urgent action.
    fn update(&mut self) -> Action {
        let mut overall = Action::Idle;
        for (raid_group, slot) in self.slots.iter_mut() {
            let events = std::mem::take(&mut slot.events);
            let action = slot.monitor.step(&events);
            if action != slot.last {
                debug!("Worker {}: rg {raid_group} {:?} -> {action:?}", self.index, slot.last);
            }
            slot.last = action;
            overall = match (overall, action) {
                (_, Action::Continue) | (Action::Continue, _) => Action::Continue,
                (_, Action::Wait) | (Action::Wait, _) => Action::Wait,
                _ => Action::Idle,
            };
        }
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.last != Action::Done);
        if self.slots.len() != before {
            info!("Worker {}: {} destroyed raid group(s) removed", self.index, before - self.slots.len());
        }
        overall
    }

    fn run(&mut self) {
        let mut last = Action::Idle;
        while !self.done {
            let block_for = match last {
                Action::Continue => None,
                Action::Wait => Some(WAIT_POLL),
                _ => Some(IDLE_POLL),
            };
            self.receive_requests(block_for);
            if self.done {
                break;
            }
            last = self.update();
        }
    }
}

struct WorkerHandle {
    sender: Sender<AdminRequest>,
    thread: Option<JoinHandle<()>>,
}

/// Runs raid group monitors on a fixed pool of worker threads. A raid
/// group is pinned to worker `raid_group % workers` for its lifetime.
pub struct Scheduler {
    workers: Vec<WorkerHandle>,
}

impl Scheduler {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(rekey_error!(InvalidParameter {
                description: "scheduler needs at least one worker".to_string(),
            }));
        }
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (sender, receiver) = channel();
            let thread = std::thread::Builder::new()
                .name(format!("rekey-worker-{index}"))
                .spawn(move || Worker::new(index, receiver).run())
                .map_err(|e| {
                    error!("Failed to spawn rekey worker {index}: {e}");
                    rekey_error!(ThreadCreation { source: e })
                })?;
            handles.push(WorkerHandle {
                sender,
                thread: Some(thread),
            });
        }
        info!("Scheduler started with {workers} worker(s)");
        Ok(Scheduler { workers: handles })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn control(&self) -> super::AdminControl {
        super::AdminControl::new(self.workers.iter().map(|w| w.sender.clone()).collect())
    }

    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(AdminRequest::Shutdown);
        }
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("Rekey worker {index} panicked");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
