//! The background dirty-page scan and its urgent-request-preempting
//! encode/send decision tree.

use crate::bitmap::BitmapManager;
use crate::compress::CompressWorkerPool;
use crate::config::Config;
use crate::counters::Counters;
use crate::delta::{self, EncodeOutcome};
use crate::error::{MigrateError, ProtocolError};
use crate::page_cache::PageCache;
use crate::region::{MemorySubsystem, Region, RegionId};
use crate::request_queue::RequestQueue;
use crate::transport::Transport;
use crate::wire::{self, Frame, FrameCursor};
use crate::TARGET_PAGE_SIZE;

/// How many pages the scan loop sends between checks of the transport's
/// rate limiter. Named, not tunable (§9 Open Questions).
pub const PACING_CHECK_STRIDE: u64 = 64;

#[derive(Debug, Default, Clone)]
pub struct PageSearchStatus {
    pub current_region: Option<RegionId>,
    pub current_page_index: u64,
    pub wrapped_once: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Sent `pages_sent` pages and stopped because the rate limiter or the
    /// requested budget was hit, not because there was nothing left dirty.
    Paced { pages_sent: u64 },
    /// Walked every region once without finding any dirty page left.
    Exhausted { pages_sent: u64 },
}

pub struct SendState {
    pub bitmaps: BitmapManager,
    pub cache: PageCache,
    pub queue: RequestQueue,
    pub counters: Counters,
    pub compress_pool: Option<CompressWorkerPool>,
    search: PageSearchStatus,
    cursor: FrameCursor,
    config: Config,
    bulk_stage: bool,
    postcopy_active: bool,
}

impl SendState {
    pub fn new(config: Config) -> Self {
        let compress_pool = config
            .compression_enabled
            .then(|| CompressWorkerPool::new(config.compression_threads, config.compression_level));
        Self {
            bitmaps: BitmapManager::new(),
            cache: PageCache::new(config.xbzrle_cache_size),
            queue: RequestQueue::new(),
            counters: Counters::new(),
            compress_pool,
            search: PageSearchStatus::default(),
            cursor: FrameCursor::new(),
            config,
            bulk_stage: true,
            postcopy_active: false,
        }
    }

    pub fn resize_cache(&mut self, new_capacity_bytes: u64) {
        self.cache.resize(new_capacity_bytes);
    }

    /// Stops XBZRLE delta selection (§4.6 item 5): once post-copy starts,
    /// the destination's live page is no longer a reliable delta base.
    pub fn begin_postcopy(&mut self) {
        self.postcopy_active = true;
    }

    pub fn sync_all(&mut self, mem: &dyn MemorySubsystem) -> u64 {
        let regions = mem.regions();
        self.bitmaps.init_maps(&regions);
        let mut newly_dirty = 0u64;
        for r in regions.iter().filter(|r| r.migratable) {
            for page in mem.sync_dirty_pages(&r.id) {
                if self.bitmaps.mark_dirty(&r.id, page) {
                    newly_dirty += 1;
                }
            }
        }
        self.cache.advance_epoch();
        self.counters.inc_dirty_sync();
        newly_dirty
    }

    /// Services one urgent post-copy request, if any is queued, ahead of
    /// the background scan.
    fn service_urgent_request(
        &mut self,
        mem: &dyn MemorySubsystem,
        regions: &[Region],
        t: &mut dyn Transport,
    ) -> Result<bool, MigrateError> {
        let Some(req) = self.queue.dequeue_one() else {
            return Ok(false);
        };
        self.counters.inc_postcopy_requests();
        let region = regions
            .iter()
            .find(|r| r.id == req.region)
            .ok_or_else(|| ProtocolError::UnknownRegion(req.region.to_string()))?;
        if !region.contains(req.offset, req.length) {
            return Err(ProtocolError::OffsetOutOfRange {
                region: req.region.to_string(),
                offset: req.offset,
                len: req.length,
            }
            .into());
        }
        let mut off = req.offset;
        let end = req.offset + req.length;
        while off < end {
            self.bitmaps.test_and_clear_dirty(&req.region, off / TARGET_PAGE_SIZE);
            self.save_target_page(mem, t, &req.region, off)?;
            off += TARGET_PAGE_SIZE;
        }
        Ok(true)
    }

    /// Advances the page-search cursor to the next dirty page, wrapping
    /// across the region list at most once per call chain.
    fn advance_cursor(&mut self) -> Option<(RegionId, u64)> {
        let order = self.bitmaps.region_order().to_vec();
        if order.is_empty() {
            return None;
        }
        let mut region_idx = match &self.search.current_region {
            Some(r) => order.iter().position(|x| x == r).unwrap_or(0),
            None => 0,
        };
        let start_region_idx = region_idx;
        loop {
            let rid = order[region_idx].clone();
            if let Some(bm) = self.bitmaps.get(&rid) {
                if let Some(bit) = bm.dirty.find_next(self.search.current_page_index) {
                    self.search.current_region = Some(rid.clone());
                    self.search.current_page_index = bit + 1;
                    return Some((rid, bit));
                }
            }
            region_idx = (region_idx + 1) % order.len();
            self.search.current_page_index = 0;
            if region_idx == start_region_idx {
                self.search.wrapped_once = true;
                self.bulk_stage = false;
                return None;
            }
        }
    }

    /// Runs the scan loop until either the rate limiter trips, `max_pages`
    /// have been sent, or every region has been walked once with nothing
    /// left dirty. Urgent requests are drained before every page the scan
    /// itself would otherwise send.
    pub fn scan_iteration(
        &mut self,
        mem: &dyn MemorySubsystem,
        t: &mut dyn Transport,
        max_pages: u64,
    ) -> Result<ScanOutcome, MigrateError> {
        let regions = mem.regions();
        let mut sent = 0u64;

        while sent < max_pages {
            if self.service_urgent_request(mem, &regions, t)? {
                continue;
            }

            let Some((region_id, page_index)) = self.advance_cursor() else {
                return Ok(ScanOutcome::Exhausted { pages_sent: sent });
            };
            self.bitmaps.test_and_clear_dirty(&region_id, page_index);
            let offset = page_index * TARGET_PAGE_SIZE;
            self.save_target_page(mem, t, &region_id, offset)?;
            sent += 1;

            if sent % PACING_CHECK_STRIDE == 0 && t.rate_limit_exceeded() {
                return Ok(ScanOutcome::Paced { pages_sent: sent });
            }
        }
        Ok(ScanOutcome::Paced { pages_sent: sent })
    }

    /// The per-page encode/send decision tree: a region-switch flush of
    /// any in-flight compression job, then zero-elision, then the
    /// sideband multifd handoff (if enabled), then compression (if
    /// enabled), then XBZRLE delta (if enabled, cached, and neither bulk
    /// stage nor post-copy are active), then a raw page as the fallback
    /// everything else degrades to.
    fn save_target_page(
        &mut self,
        mem: &dyn MemorySubsystem,
        t: &mut dyn Transport,
        region: &RegionId,
        offset: u64,
    ) -> Result<usize, MigrateError> {
        let page = unsafe {
            let ptr = mem.map_host(region, offset);
            std::slice::from_raw_parts(ptr, TARGET_PAGE_SIZE as usize)
        };

        // Flush any page still buffered in a compression worker before
        // crossing into a new region, so that region's block-id frame is
        // never preceded on the wire by a CONTINUE frame still naming the
        // old region (§4.6 item 2, §5 wire invariant).
        if self.compress_pool.is_some() && self.cursor.last_region() != Some(region) {
            if let Some(pool) = &self.compress_pool {
                pool.flush_all();
            }
        }

        if page.iter().all(|&b| b == 0) {
            wire::write_frame(t, &mut self.cursor, &Frame::Zero { region: region.clone(), offset })?;
            if self.compress_pool.is_none() {
                self.cache.insert(region.clone(), offset, page);
            }
            self.counters.inc_duplicate();
            self.maybe_release(mem, region, offset);
            return Ok(0);
        }

        if self.config.multifd_enabled {
            // The sideband multifd channel is out of this crate's scope
            // (§1): it claims the page entirely, so nothing is written to
            // this wire stream for it, but it still counts as sent.
            self.counters.inc_normal();
            self.counters.add_transferred(page.len() as u64);
            self.maybe_release(mem, region, offset);
            return Ok(page.len());
        }

        if let Some(pool) = &self.compress_pool {
            let ticket = pool.submit(page.to_vec());
            let compressed = pool.collect(ticket);
            self.counters.add_transferred(compressed.len() as u64);
            self.counters.inc_normal();
            wire::write_frame(
                t,
                &mut self.cursor,
                &Frame::Compressed { region: region.clone(), offset, data: compressed },
            )?;
            self.maybe_release(mem, region, offset);
            return Ok(page.len());
        }

        if self.config.xbzrle_enabled && !self.bulk_stage && !self.postcopy_active {
            if self.cache.is_cached(region, offset) {
                let old = self.cache.get(region, offset).unwrap().to_vec();
                let mut enc = vec![0u8; TARGET_PAGE_SIZE as usize];
                match delta::encode(&old, page, &mut enc) {
                    EncodeOutcome::Identical => {
                        self.counters.inc_duplicate();
                        return Ok(0);
                    }
                    EncodeOutcome::Encoded(n) => {
                        self.counters.record_xbzrle_hit(n as u64);
                        self.cache.insert(region.clone(), offset, page);
                        wire::write_frame(
                            t,
                            &mut self.cursor,
                            &Frame::Xbzrle { region: region.clone(), offset, data: enc[..n].to_vec() },
                        )?;
                        self.maybe_release(mem, region, offset);
                        return Ok(n);
                    }
                    EncodeOutcome::Overflow => {
                        self.counters.inc_xbzrle_overflow();
                    }
                }
            } else {
                self.counters.inc_xbzrle_cache_miss();
            }
            self.cache.insert(region.clone(), offset, page);
        }

        self.counters.inc_normal();
        self.counters.add_transferred(page.len() as u64);
        wire::write_frame(
            t,
            &mut self.cursor,
            &Frame::Raw { region: region.clone(), offset, data: page.to_vec() },
        )?;
        self.maybe_release(mem, region, offset);
        Ok(page.len())
    }

    fn maybe_release(&self, mem: &dyn MemorySubsystem, region: &RegionId, offset: u64) {
        if self.config.release_ram_after_send {
            mem.discard_range(region, offset, TARGET_PAGE_SIZE);
        }
    }

    pub fn is_bulk_stage(&self) -> bool {
        self.bulk_stage
    }

    pub fn pending_dirty(&self) -> u64 {
        self.bitmaps.total_dirty()
    }
}
