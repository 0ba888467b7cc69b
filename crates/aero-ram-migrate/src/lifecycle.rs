//! The `Engine`: setup / iterate / complete / pending / post-copy discard /
//! resume-prepare / cleanup, all owned by one explicit struct rather than
//! the global `ram_state`/cache/worker-pool singletons the original used.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::MigrateError;
use crate::receiver::RecvState;
use crate::region::MemorySubsystem;
use crate::request_queue::RequestSpec;
use crate::scanner::{ScanOutcome, SendState};
use crate::transport::Transport;
use crate::wire::{self, Frame, FrameCursor};
use crate::TARGET_PAGE_SIZE;

/// Feedback from dirty-rate tracking (§9 SUPPLEMENT). Not an error -- a
/// signal the embedding application may act on by throttling the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    Steady,
    ThrottleGuest,
}

/// Tracks dirty-vs-transferred byte ratio across sync periods and raises
/// `ThrottleGuest` only after two consecutive periods exceed the
/// threshold, matching `migration_bitmap_sync`'s two-strikes rule rather
/// than a single-sample heuristic.
pub struct ThrottleTracker {
    threshold: f64,
    consecutive_strikes: u32,
    last_transferred: u64,
    last_dirty_pages: u64,
}

impl ThrottleTracker {
    pub fn new() -> Self {
        Self {
            threshold: 0.5,
            consecutive_strikes: 0,
            last_transferred: 0,
            last_dirty_pages: 0,
        }
    }

    pub fn observe(&mut self, transferred_this_period: u64, dirty_pages_this_period: u64) -> ThrottleSignal {
        self.last_transferred = transferred_this_period;
        self.last_dirty_pages = dirty_pages_this_period;
        let dirty_bytes = dirty_pages_this_period * TARGET_PAGE_SIZE;
        let exceeded = transferred_this_period > 0
            && (dirty_bytes as f64) > self.threshold * (transferred_this_period as f64);
        if exceeded {
            self.consecutive_strikes += 1;
        } else {
            self.consecutive_strikes = 0;
        }
        if self.consecutive_strikes >= 2 {
            ThrottleSignal::ThrottleGuest
        } else {
            ThrottleSignal::Steady
        }
    }
}

impl Default for ThrottleTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine {
    config: Config,
    mem: Arc<dyn MemorySubsystem>,
    send: SendState,
    throttle: ThrottleTracker,
}

impl Engine {
    pub fn new(config: Config, mem: Arc<dyn MemorySubsystem>) -> Self {
        let send = SendState::new(config.clone());
        Self {
            config,
            mem,
            send,
            throttle: ThrottleTracker::new(),
        }
    }

    #[instrument(skip_all)]
    pub fn setup(&mut self, t: &mut dyn Transport) -> Result<(), MigrateError> {
        let regions = self.mem.regions();
        wire::write_mem_size_handshake(t, &regions, self.config.postcopy_enabled)?;
        let dirtied = self.send.sync_all(self.mem.as_ref());
        info!(dirtied, "migration setup complete, initial bitmap synced");
        Ok(())
    }

    /// Marks the send side as having entered post-copy, so the scanner's
    /// decision tree stops selecting XBZRLE delta (§4.6 item 5).
    pub fn begin_postcopy(&mut self) {
        self.send.begin_postcopy();
    }

    /// Runs one bounded slice of the background scan, sending up to
    /// `max_pages` pages (fewer if the transport's rate limiter trips
    /// first). Returns whether anything dirty remains.
    #[instrument(skip_all, fields(max_pages))]
    pub fn iterate(&mut self, t: &mut dyn Transport, max_pages: u64) -> Result<ScanOutcome, MigrateError> {
        let before = self.send.counters.transferred_bytes.load(std::sync::atomic::Ordering::Relaxed);
        let outcome = self.send.scan_iteration(self.mem.as_ref(), t, max_pages)?;
        let after = self.send.counters.transferred_bytes.load(std::sync::atomic::Ordering::Relaxed);
        let signal = self.throttle.observe(after - before, self.send.pending_dirty());
        if signal == ThrottleSignal::ThrottleGuest {
            warn!("dirty rate outpacing transfer for two consecutive syncs; throttling guest");
        }
        debug!(?outcome, "scan iteration complete");
        Ok(outcome)
    }

    /// Pages still dirty and unsent, for the caller's convergence check.
    pub fn pending(&self) -> u64 {
        self.send.pending_dirty()
    }

    /// Drains the scan to completion (stop-and-copy) and emits the final
    /// end-of-stream frame for every region.
    #[instrument(skip_all)]
    pub fn complete(&mut self, t: &mut dyn Transport) -> Result<(), MigrateError> {
        loop {
            match self.send.scan_iteration(self.mem.as_ref(), t, u64::MAX)? {
                ScanOutcome::Exhausted { .. } => break,
                ScanOutcome::Paced { .. } => continue,
            }
        }
        let mut cursor = FrameCursor::new();
        wire::write_frame(t, &mut cursor, &Frame::Eos)?;
        t.flush()?;
        info!("migration complete, EOS sent");
        Ok(())
    }

    pub fn resize_cache(&mut self, new_capacity_bytes: u64) {
        self.send.resize_cache(new_capacity_bytes);
    }

    pub fn queue_request(&mut self, spec: RequestSpec) -> Result<(), &'static str> {
        self.send.queue.enqueue(spec)
    }

    /// Host-page-atomic canonicalization before post-copy discards are
    /// sent: any host page with at least one unsent target page becomes
    /// fully unsent, so the discard never straddles a partially-placed
    /// host page.
    pub fn canonicalize_for_postcopy(&mut self, host_page_ratio: u64) {
        for region in self.send.bitmaps.region_order().to_vec() {
            self.send.bitmaps.chunk_hostpages(&region, host_page_ratio);
        }
    }

    /// Sends one `Discard` frame per contiguous unsent run, per region,
    /// so the destination can zero-fill or otherwise account for bytes it
    /// will never receive (`ram_xbzrle_postcopy_send_discard_bitmap`).
    #[instrument(skip_all)]
    pub fn postcopy_send_discard_bitmap(&mut self, t: &mut dyn Transport) -> Result<(), MigrateError> {
        let mut cursor = FrameCursor::new();
        for region in self.send.bitmaps.region_order().to_vec() {
            let Some(bm) = self.send.bitmaps.get(&region) else {
                continue;
            };
            let mut page = 0u64;
            let npages = bm.unsent.len();
            while page < npages {
                if !bm.unsent.get(page) {
                    page += 1;
                    continue;
                }
                let run_start = page;
                while page < npages && bm.unsent.get(page) {
                    page += 1;
                }
                let run_len = page - run_start;
                wire::write_frame(
                    t,
                    &mut cursor,
                    &Frame::Discard {
                        region: region.clone(),
                        offset: run_start * TARGET_PAGE_SIZE,
                        length: run_len * TARGET_PAGE_SIZE,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Resets the search cursor so the next `iterate` starts a fresh
    /// walk across all regions (called after a migration is paused and
    /// then resumed, e.g. a failed post-copy recovering to precopy).
    pub fn resume_prepare(&mut self) {
        self.send.bitmaps.init_maps(&self.mem.regions());
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

pub struct ReceiverEngine {
    mem: Arc<dyn MemorySubsystem>,
    recv: RecvState,
    postcopy_advised: bool,
}

impl ReceiverEngine {
    pub fn new(config: Config, mem: Arc<dyn MemorySubsystem>) -> Self {
        let postcopy_advised = config.postcopy_enabled;
        let mut recv = RecvState::new(&config);
        recv.init_maps(mem.as_ref());
        Self { mem, recv, postcopy_advised }
    }

    /// Reads the `MEM_SIZE` handshake (§4.7, scenario S1) against this
    /// engine's own region catalog, returning the peer-declared total RAM
    /// byte count.
    pub fn accept_handshake(&mut self, t: &mut dyn Transport) -> Result<u64, MigrateError> {
        let regions = self.mem.regions();
        wire::read_mem_size_handshake(t, &regions, self.postcopy_advised)
    }

    /// Precopy receive loop: applies frames until `Eos`.
    #[instrument(skip_all)]
    pub fn run_precopy(&mut self, t: &mut dyn Transport) -> Result<(), MigrateError> {
        loop {
            if self.recv.receive_one(self.mem.as_ref(), t)? {
                return Ok(());
            }
        }
    }

    pub fn begin_postcopy(&mut self) {
        self.recv.begin_postcopy();
    }

    /// Post-copy receive loop: frames are dispatched through the
    /// host-page-atomic assembly path rather than written straight to
    /// memory, since hugetlbfs requires placing a whole host page in one
    /// operation. The caller is expected to be driving this from a
    /// dedicated thread so vCPU page faults can enqueue urgent requests
    /// concurrently.
    #[instrument(skip_all)]
    pub fn run_postcopy(&mut self, t: &mut dyn Transport) -> Result<(), MigrateError> {
        loop {
            if self.recv.receive_one_postcopy(self.mem.as_ref(), t)? {
                return Ok(());
            }
        }
    }

    pub fn is_placed(&self, region: &crate::region::RegionId, offset: u64) -> crate::receiver::PostcopyPageState {
        self.recv.is_placed(region, offset)
    }
}
