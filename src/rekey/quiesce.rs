use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::shared::RekeySharedState;
use crate::{rekey_error, Result};

const BOOT_TOKEN: u64 = 0;

/// Proof that the raid group is quiesced. Handed back to `unquiesce`.
#[derive(Debug)]
#[must_use]
pub struct QuiesceToken {
    id: u64,
}

/// Pauses client admission around rekey-critical transitions and waits,
/// without blocking the monitor, for in-flight requests to drain.
///
/// Held requests stay queued in the client channels and are replayed
/// once admission resumes.
#[derive(Debug)]
pub struct QuiesceCoordinator {
    shared: RekeySharedState,
    timeout: Duration,
    draining_since: Option<Instant>,
    chunk_draining_since: Option<(u64, Instant)>,
    outstanding: Option<u64>,
    boot_pending: bool,
    next_id: u64,
}

impl QuiesceCoordinator {
    /// The shared state starts quiesced, so a fresh coordinator already
    /// owns that quiesce; `boot_token` hands it out.
    pub fn new(shared: RekeySharedState, timeout: Duration) -> Self {
        let boot_pending = shared.is_quiesced();
        QuiesceCoordinator {
            shared,
            timeout,
            draining_since: None,
            chunk_draining_since: None,
            outstanding: boot_pending.then_some(BOOT_TOKEN),
            boot_pending,
            next_id: BOOT_TOKEN + 1,
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.shared.is_quiesced()
    }

    /// Token for the quiesce in place since boot, if not yet handed out.
    pub fn boot_token(&mut self) -> Option<QuiesceToken> {
        if !self.boot_pending {
            return None;
        }
        self.boot_pending = false;
        Some(QuiesceToken { id: BOOT_TOKEN })
    }

    /// Closes admission. Requests already admitted keep running.
    pub fn begin_quiesce(&mut self) {
        if self.draining_since.is_none() {
            self.shared.set_quiesced(true);
            self.draining_since = Some(Instant::now());
            debug!("Quiesce requested with {} requests in flight", self.shared.inflight());
        }
    }

    fn timeout_error(&self, since: Instant, inflight: usize) -> crate::RekeyError {
        let err = rekey_error!(QuiesceTimeout {
            waited_ms: since.elapsed().as_millis() as u64,
            inflight,
        });
        error!("{err}");
        err
    }

    /// Returns the token once everything admitted before `begin_quiesce`
    /// finished. Fails when the drain outlives the quiesce timeout.
    pub fn poll_quiesce(&mut self) -> Result<Option<QuiesceToken>> {
        let Some(since) = self.draining_since else {
            return Err(rekey_error!(InvalidParameter {
                description: "poll_quiesce called without begin_quiesce".to_string(),
            }));
        };
        let inflight = self.shared.inflight();
        if inflight == 0 {
            self.draining_since = None;
            let id = self.next_id;
            self.next_id += 1;
            self.outstanding = Some(id);
            debug!("Quiesced after {:?}", since.elapsed());
            return Ok(Some(QuiesceToken { id }));
        }
        if since.elapsed() >= self.timeout {
            return Err(self.timeout_error(since, inflight));
        }
        Ok(None)
    }

    /// Blocking form of `begin_quiesce` plus `poll_quiesce`.
    pub fn quiesce(&mut self) -> Result<QuiesceToken> {
        self.begin_quiesce();
        loop {
            if let Some(token) = self.poll_quiesce()? {
                return Ok(token);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Reopens admission; held requests are picked up on their next poll.
    pub fn unquiesce(&mut self, token: QuiesceToken) {
        if self.outstanding != Some(token.id) {
            warn!("Ignoring unquiesce with stale token {}", token.id);
            return;
        }
        self.outstanding = None;
        self.shared.set_quiesced(false);
        info!("Raid group unquiesced");
    }

    /// Closes admission to one chunk and starts waiting for its requests.
    pub fn lock_chunk(&mut self, chunk: u64) {
        self.shared.lock_chunk(chunk);
        self.chunk_draining_since = Some((chunk, Instant::now()));
    }

    /// Whether every request admitted to `chunk` before `lock_chunk` is done.
    pub fn poll_chunk_drained(&mut self, chunk: u64) -> Result<bool> {
        let inflight = self.shared.chunk_inflight(chunk) as usize;
        if inflight == 0 {
            self.chunk_draining_since = None;
            return Ok(true);
        }
        match self.chunk_draining_since {
            Some((locked, since)) if locked == chunk && since.elapsed() >= self.timeout => {
                Err(self.timeout_error(since, inflight))
            }
            _ => Ok(false),
        }
    }

    pub fn unlock_chunk(&mut self, chunk: u64) {
        self.shared.unlock_chunk(chunk);
    }
}
