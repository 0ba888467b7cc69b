//! The receive side: precopy dispatch plus the post-copy state machine
//! that distinguishes "not yet placed" from "placed, awaiting backing".

use std::collections::HashMap;

use crate::bitmap::BitmapManager;
use crate::compress::DecompressWorkerPool;
use crate::config::Config;
use crate::delta;
use crate::error::{MigrateError, ProtocolError};
use crate::region::{MemorySubsystem, RegionId};
use crate::wire::{self, Frame, FrameCursor};
use crate::TARGET_PAGE_SIZE;

/// A page's life cycle once post-copy is active: the destination may know
/// a page exists (bitmap initialized) before it has actually been written,
/// and a reader faulting on one in between must be made to block rather
/// than observe stale/zero memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostcopyPageState {
    NotSent,
    Placed,
}

/// The in-progress accumulation of one host page's worth of target pages.
/// Hugetlbfs requires the whole host page be placed in a single operation,
/// so target pages belonging to the same host page are buffered here
/// until the last one arrives (§4.8).
struct HostPageAssembly {
    host_base: u64,
    buffer: Vec<u8>,
    filled: u64,
    all_zero: bool,
}

impl HostPageAssembly {
    fn new(host_base: u64, host_page_len: usize) -> Self {
        Self {
            host_base,
            buffer: vec![0u8; host_page_len],
            filled: 0,
            all_zero: true,
        }
    }
}

pub struct RecvState {
    pub bitmaps: BitmapManager,
    decompress_pool: Option<DecompressWorkerPool>,
    cursor: FrameCursor,
    postcopy_active: bool,
    assembly: HashMap<RegionId, HostPageAssembly>,
}

impl RecvState {
    pub fn new(config: &Config) -> Self {
        let decompress_pool = config
            .compression_enabled
            .then(|| DecompressWorkerPool::new(config.decompression_threads, config.compression_level));
        Self {
            bitmaps: BitmapManager::new(),
            decompress_pool,
            cursor: FrameCursor::new(),
            postcopy_active: false,
            assembly: HashMap::new(),
        }
    }

    pub fn init_maps(&mut self, mem: &dyn MemorySubsystem) {
        self.bitmaps.init_maps(&mem.regions());
    }

    pub fn begin_postcopy(&mut self) {
        self.postcopy_active = true;
    }

    /// Applies one frame to guest memory via `mem`. Returns `true` once an
    /// `Eos` frame for the final region has been observed (precopy) -- the
    /// caller decides when that means the whole migration is complete.
    pub fn receive_one(
        &mut self,
        mem: &dyn MemorySubsystem,
        t: &mut dyn crate::transport::Transport,
    ) -> Result<bool, MigrateError> {
        let frame = wire::read_frame(t, &mut self.cursor)?;
        match frame {
            Frame::Eos => Ok(true),
            Frame::MultifdSync => Ok(false),
            Frame::Discard { region, offset, length } => {
                if let Some(bm) = self.bitmaps.get_mut(&region) {
                    let mut page = offset / TARGET_PAGE_SIZE;
                    let end = (offset + length) / TARGET_PAGE_SIZE;
                    while page < end {
                        bm.unsent.clear_bit(page);
                        page += 1;
                    }
                }
                Ok(false)
            }
            Frame::Zero { .. } | Frame::Raw { .. } | Frame::Compressed { .. } | Frame::Xbzrle { .. } => {
                let (region, offset, data, _all_zero) = self.decode_payload(mem, frame)?;
                self.write_page(mem, &region, offset, data)?;
                Ok(false)
            }
        }
    }

    /// Decodes a page-carrying frame into its target region, offset, raw
    /// bytes, and whether it came from a `ZERO` frame (used by post-copy
    /// assembly to decide whether the zero fast-path applies). Does not
    /// mutate guest memory or the received/unsent bitmaps.
    fn decode_payload(
        &mut self,
        mem: &dyn MemorySubsystem,
        frame: Frame,
    ) -> Result<(RegionId, u64, Vec<u8>, bool), MigrateError> {
        match frame {
            Frame::Zero { region, offset } => Ok((region, offset, vec![0u8; TARGET_PAGE_SIZE as usize], true)),
            Frame::Raw { region, offset, data } => {
                if data.len() != TARGET_PAGE_SIZE as usize {
                    return Err(ProtocolError::DecompressedLengthMismatch {
                        expected: TARGET_PAGE_SIZE as usize,
                        got: data.len(),
                    }
                    .into());
                }
                Ok((region, offset, data, false))
            }
            Frame::Compressed { region, offset, data } => {
                let pool = self
                    .decompress_pool
                    .as_ref()
                    .ok_or(ProtocolError::UnnegotiatedCompression)?;
                let ticket = pool.submit(data);
                let decompressed = pool.collect(ticket);
                if decompressed.len() != TARGET_PAGE_SIZE as usize {
                    return Err(ProtocolError::DecompressedLengthMismatch {
                        expected: TARGET_PAGE_SIZE as usize,
                        got: decompressed.len(),
                    }
                    .into());
                }
                Ok((region, offset, decompressed, false))
            }
            Frame::Xbzrle { region, offset, data } => {
                // The delta's base is whatever this host page already
                // holds: the destination's last write to this offset (or
                // its initial content, if this is the first write), same
                // as the original relying on the live RAM page itself
                // rather than a side cache.
                let regions = mem.regions();
                let r = regions
                    .iter()
                    .find(|r| r.id == region)
                    .ok_or_else(|| ProtocolError::UnknownRegion(region.to_string()))?;
                if !r.contains(offset, TARGET_PAGE_SIZE) {
                    return Err(ProtocolError::OffsetOutOfRange {
                        region: region.to_string(),
                        offset,
                        len: TARGET_PAGE_SIZE,
                    }
                    .into());
                }
                let old = unsafe {
                    let ptr = mem.map_host(&region, offset);
                    std::slice::from_raw_parts(ptr, TARGET_PAGE_SIZE as usize).to_vec()
                };
                let mut out = vec![0u8; TARGET_PAGE_SIZE as usize];
                delta::decode(&old, &data, &mut out).map_err(|_| ProtocolError::DeltaCorrupt)?;
                Ok((region, offset, out, false))
            }
            Frame::Eos | Frame::MultifdSync | Frame::Discard { .. } => {
                unreachable!("control frames are dispatched before decode_payload is called")
            }
        }
    }

    /// Applies one frame during post-copy: control frames behave exactly
    /// as in precopy, but page-carrying frames are buffered per host page
    /// and only placed once the whole host page has arrived, in order
    /// (§4.8). A target page arriving out of sequence within its host
    /// page is a protocol violation, not a recoverable condition.
    pub fn receive_one_postcopy(
        &mut self,
        mem: &dyn MemorySubsystem,
        t: &mut dyn crate::transport::Transport,
    ) -> Result<bool, MigrateError> {
        let frame = wire::read_frame(t, &mut self.cursor)?;
        match frame {
            Frame::Eos => Ok(true),
            Frame::MultifdSync => Ok(false),
            Frame::Discard { region, offset, length } => {
                if let Some(bm) = self.bitmaps.get_mut(&region) {
                    let mut page = offset / TARGET_PAGE_SIZE;
                    let end = (offset + length) / TARGET_PAGE_SIZE;
                    while page < end {
                        bm.unsent.clear_bit(page);
                        page += 1;
                    }
                }
                Ok(false)
            }
            data_frame => {
                let (region, offset, data, all_zero) = self.decode_payload(mem, data_frame)?;
                self.accumulate_postcopy(mem, region, offset, data, all_zero)?;
                Ok(false)
            }
        }
    }

    /// Buffers one target page's worth of data into its enclosing host
    /// page's assembly buffer, placing the host page atomically once every
    /// target page within it has arrived.
    fn accumulate_postcopy(
        &mut self,
        mem: &dyn MemorySubsystem,
        region: RegionId,
        offset: u64,
        data: Vec<u8>,
        frame_all_zero: bool,
    ) -> Result<(), MigrateError> {
        let regions = mem.regions();
        let r = regions
            .iter()
            .find(|r| r.id == region)
            .ok_or_else(|| ProtocolError::UnknownRegion(region.to_string()))?;
        if !r.contains(offset, TARGET_PAGE_SIZE) {
            return Err(ProtocolError::OffsetOutOfRange {
                region: region.to_string(),
                offset,
                len: TARGET_PAGE_SIZE,
            }
            .into());
        }
        let host_page_len = r.page_size;

        let host_base = (offset / host_page_len) * host_page_len;
        let needs_fresh = match self.assembly.get(&region) {
            Some(a) => a.host_base != host_base,
            None => true,
        };
        if needs_fresh {
            // A previous host page in this region that never finished is
            // an abandoned, non-sequential shipment, not something a new
            // host page can silently supersede.
            if let Some(prev) = self.assembly.get(&region) {
                if prev.filled != prev.buffer.len() as u64 {
                    return Err(ProtocolError::NonSequentialTargetPage {
                        expected: prev.host_base + prev.filled,
                        got: offset,
                    }
                    .into());
                }
            }
            // Starting a new host page mid-way through (not at its first
            // target page) can never be valid: every byte up to `offset`
            // would be left unwritten in the assembly buffer.
            if offset != host_base {
                return Err(ProtocolError::NonSequentialTargetPage {
                    expected: host_base,
                    got: offset,
                }
                .into());
            }
            self.assembly
                .insert(region.clone(), HostPageAssembly::new(host_base, host_page_len as usize));
        }

        let assembly = self.assembly.get_mut(&region).expect("just inserted or present");
        let expected_offset = assembly.host_base + assembly.filled;
        if offset != expected_offset {
            return Err(ProtocolError::NonSequentialTargetPage {
                expected: expected_offset,
                got: offset,
            }
            .into());
        }

        let start = (offset - assembly.host_base) as usize;
        assembly.buffer[start..start + data.len()].copy_from_slice(&data);
        assembly.filled += data.len() as u64;
        assembly.all_zero &= frame_all_zero;

        if assembly.filled == host_page_len {
            let assembly = self.assembly.remove(&region).expect("present");
            self.place_host_page(mem, &region, assembly)?;
        }
        Ok(())
    }

    /// Installs a fully-assembled host page. `all_zero` pages may use the
    /// zero fast-path (`place_page_zero` in the original); this crate has
    /// no separate zero-backing primitive, so it always writes the
    /// buffer, which is already all-zero in that case.
    fn place_host_page(
        &mut self,
        mem: &dyn MemorySubsystem,
        region: &RegionId,
        assembly: HostPageAssembly,
    ) -> Result<(), MigrateError> {
        if assembly.all_zero {
            tracing::trace!(host_base = assembly.host_base, "placing host page via zero fast-path");
        }
        unsafe {
            let ptr = mem.map_host(region, assembly.host_base) as *mut u8;
            std::ptr::copy_nonoverlapping(assembly.buffer.as_ptr(), ptr, assembly.buffer.len());
        }
        if let Some(bm) = self.bitmaps.get_mut(region) {
            let ratio = (assembly.buffer.len() as u64) / TARGET_PAGE_SIZE;
            let first_page = assembly.host_base / TARGET_PAGE_SIZE;
            for p in first_page..first_page + ratio {
                bm.received.set(p);
                bm.unsent.clear_bit(p);
            }
        }
        Ok(())
    }

    fn write_page(
        &mut self,
        mem: &dyn MemorySubsystem,
        region: &RegionId,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), MigrateError> {
        let regions = mem.regions();
        let r = regions
            .iter()
            .find(|r| &r.id == region)
            .ok_or_else(|| ProtocolError::UnknownRegion(region.to_string()))?;
        if !r.contains(offset, TARGET_PAGE_SIZE) {
            return Err(ProtocolError::OffsetOutOfRange {
                region: region.to_string(),
                offset,
                len: TARGET_PAGE_SIZE,
            }
            .into());
        }

        unsafe {
            let ptr = mem.map_host(region, offset) as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }

        if let Some(bm) = self.bitmaps.get_mut(region) {
            bm.received.set(offset / TARGET_PAGE_SIZE);
            bm.unsent.clear_bit(offset / TARGET_PAGE_SIZE);
        }
        Ok(())
    }

    pub fn is_placed(&self, region: &RegionId, offset: u64) -> PostcopyPageState {
        match self.bitmaps.get(region) {
            Some(bm) if bm.received.get(offset / TARGET_PAGE_SIZE) => PostcopyPageState::Placed,
            _ => PostcopyPageState::NotSent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::transport::MemTransport;
    use std::cell::RefCell;

    struct FakeMem {
        buf: RefCell<Vec<u8>>,
        region_id: RegionId,
    }

    impl MemorySubsystem for FakeMem {
        fn regions(&self) -> Vec<Region> {
            vec![Region {
                id: self.region_id.clone(),
                used_length: self.buf.borrow().len() as u64,
                max_length: self.buf.borrow().len() as u64,
                page_size: TARGET_PAGE_SIZE,
                migratable: true,
            }]
        }

        fn sync_dirty_pages(&self, _region: &RegionId) -> Vec<u64> {
            Vec::new()
        }

        unsafe fn map_host(&self, _region: &RegionId, offset: u64) -> *const u8 {
            self.buf.borrow().as_ptr().add(offset as usize)
        }
    }

    #[test]
    fn receives_zero_then_raw_frame() {
        let region_id = RegionId::new("ram0").unwrap();
        let mem = FakeMem {
            buf: RefCell::new(vec![0xFFu8; TARGET_PAGE_SIZE as usize * 2]),
            region_id: region_id.clone(),
        };

        let mut wt = MemTransport::new();
        let mut wc = FrameCursor::new();
        wire::write_frame(&mut wt, &mut wc, &Frame::Zero { region: region_id.clone(), offset: 0 }).unwrap();
        wire::write_frame(
            &mut wt,
            &mut wc,
            &Frame::Raw {
                region: region_id.clone(),
                offset: TARGET_PAGE_SIZE,
                data: vec![0x42u8; TARGET_PAGE_SIZE as usize],
            },
        )
        .unwrap();
        wire::write_frame(&mut wt, &mut wc, &Frame::Eos).unwrap();

        let mut rt = MemTransport::from_bytes(wt.into_inner());
        let mut recv = RecvState::new(&Config::default());
        recv.init_maps(&mem);

        assert!(!recv.receive_one(&mem, &mut rt).unwrap());
        assert!(!recv.receive_one(&mem, &mut rt).unwrap());
        assert!(recv.receive_one(&mem, &mut rt).unwrap());

        let buf = mem.buf.borrow();
        assert!(buf[..TARGET_PAGE_SIZE as usize].iter().all(|&b| b == 0));
        assert!(buf[TARGET_PAGE_SIZE as usize..].iter().all(|&b| b == 0x42));
    }

    #[test]
    fn unknown_region_is_rejected() {
        let region_id = RegionId::new("ram0").unwrap();
        let other = RegionId::new("ram1").unwrap();
        let mem = FakeMem {
            buf: RefCell::new(vec![0u8; TARGET_PAGE_SIZE as usize]),
            region_id,
        };
        let mut wt = MemTransport::new();
        let mut wc = FrameCursor::new();
        wire::write_frame(&mut wt, &mut wc, &Frame::Zero { region: other, offset: 0 }).unwrap();
        let mut rt = MemTransport::from_bytes(wt.into_inner());
        let mut recv = RecvState::new(&Config::default());
        recv.init_maps(&mem);
        assert!(recv.receive_one(&mem, &mut rt).is_err());
    }

    /// A region whose host page is larger than one target page, for
    /// exercising the post-copy host-page-atomic assembly path.
    struct HugeMem {
        buf: RefCell<Vec<u8>>,
        region_id: RegionId,
        page_size: u64,
    }

    impl MemorySubsystem for HugeMem {
        fn regions(&self) -> Vec<Region> {
            vec![Region {
                id: self.region_id.clone(),
                used_length: self.buf.borrow().len() as u64,
                max_length: self.buf.borrow().len() as u64,
                page_size: self.page_size,
                migratable: true,
            }]
        }

        fn sync_dirty_pages(&self, _region: &RegionId) -> Vec<u64> {
            Vec::new()
        }

        unsafe fn map_host(&self, _region: &RegionId, offset: u64) -> *const u8 {
            self.buf.borrow().as_ptr().add(offset as usize)
        }
    }

    #[test]
    fn postcopy_places_host_page_only_after_every_target_page_arrives() {
        let region_id = RegionId::new("ram0").unwrap();
        let mem = HugeMem {
            buf: RefCell::new(vec![0xAAu8; 16384]),
            region_id: region_id.clone(),
            page_size: 16384,
        };

        let mut wt = MemTransport::new();
        let mut wc = FrameCursor::new();
        for i in 0..4u64 {
            wire::write_frame(
                &mut wt,
                &mut wc,
                &Frame::Raw {
                    region: region_id.clone(),
                    offset: i * TARGET_PAGE_SIZE,
                    data: vec![(i + 1) as u8; TARGET_PAGE_SIZE as usize],
                },
            )
            .unwrap();
        }

        let mut rt = MemTransport::from_bytes(wt.into_inner());
        let mut recv = RecvState::new(&Config::default());
        recv.init_maps(&mem);
        recv.begin_postcopy();

        for i in 0..3 {
            assert!(!recv.receive_one_postcopy(&mem, &mut rt).unwrap());
            assert_eq!(recv.is_placed(&region_id, i * TARGET_PAGE_SIZE), PostcopyPageState::NotSent);
            assert!(mem.buf.borrow().iter().all(|&b| b == 0xAA), "host page not placed until fully assembled");
        }
        assert!(!recv.receive_one_postcopy(&mem, &mut rt).unwrap());

        let buf = mem.buf.borrow();
        for i in 0..4usize {
            let start = i * TARGET_PAGE_SIZE as usize;
            assert!(buf[start..start + TARGET_PAGE_SIZE as usize].iter().all(|&b| b == (i + 1) as u8));
        }
        for i in 0..4u64 {
            assert_eq!(recv.is_placed(&region_id, i * TARGET_PAGE_SIZE), PostcopyPageState::Placed);
        }
    }

    #[test]
    fn postcopy_rejects_non_sequential_target_page() {
        let region_id = RegionId::new("ram0").unwrap();
        let mem = HugeMem {
            buf: RefCell::new(vec![0u8; 16384]),
            region_id: region_id.clone(),
            page_size: 16384,
        };

        let mut wt = MemTransport::new();
        let mut wc = FrameCursor::new();
        wire::write_frame(
            &mut wt,
            &mut wc,
            &Frame::Raw { region: region_id.clone(), offset: 0, data: vec![1u8; TARGET_PAGE_SIZE as usize] },
        )
        .unwrap();
        // Skip the target page at offset 4096 and jump straight to 8192.
        wire::write_frame(
            &mut wt,
            &mut wc,
            &Frame::Raw {
                region: region_id.clone(),
                offset: 2 * TARGET_PAGE_SIZE,
                data: vec![2u8; TARGET_PAGE_SIZE as usize],
            },
        )
        .unwrap();

        let mut rt = MemTransport::from_bytes(wt.into_inner());
        let mut recv = RecvState::new(&Config::default());
        recv.init_maps(&mem);
        recv.begin_postcopy();

        assert!(!recv.receive_one_postcopy(&mem, &mut rt).unwrap());
        let err = recv.receive_one_postcopy(&mem, &mut rt).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Protocol(ProtocolError::NonSequentialTargetPage { .. })
        ));
    }

    #[test]
    fn postcopy_all_zero_host_page_places_as_zero() {
        let region_id = RegionId::new("ram0").unwrap();
        let mem = HugeMem {
            buf: RefCell::new(vec![0xFFu8; 16384]),
            region_id: region_id.clone(),
            page_size: 16384,
        };

        let mut wt = MemTransport::new();
        let mut wc = FrameCursor::new();
        for i in 0..4u64 {
            wire::write_frame(
                &mut wt,
                &mut wc,
                &Frame::Zero { region: region_id.clone(), offset: i * TARGET_PAGE_SIZE },
            )
            .unwrap();
        }

        let mut rt = MemTransport::from_bytes(wt.into_inner());
        let mut recv = RecvState::new(&Config::default());
        recv.init_maps(&mem);
        recv.begin_postcopy();
        for _ in 0..4 {
            recv.receive_one_postcopy(&mem, &mut rt).unwrap();
        }
        assert!(mem.buf.borrow().iter().all(|&b| b == 0));
    }
}
