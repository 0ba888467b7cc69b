//! The scan loop must stop sending once the transport reports its rate
//! limit exceeded, and must check no more often than every
//! `PACING_CHECK_STRIDE` pages.

use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use aero_ram_migrate::region::{MemorySubsystem, Region, RegionId};
use aero_ram_migrate::transport::Transport;
use aero_ram_migrate::{Config, Engine, ScanOutcome, PACING_CHECK_STRIDE};

const PAGE: u64 = aero_ram_migrate::TARGET_PAGE_SIZE;

struct TestMemory {
    region: Region,
    bytes: StdMutex<Vec<u8>>,
}

impl MemorySubsystem for TestMemory {
    fn regions(&self) -> Vec<Region> {
        vec![self.region.clone()]
    }

    fn sync_dirty_pages(&self, _region: &RegionId) -> Vec<u64> {
        (0..self.region.page_count()).collect()
    }

    unsafe fn map_host(&self, _region: &RegionId, offset: u64) -> *const u8 {
        self.bytes.lock().unwrap().as_ptr().add(offset as usize)
    }
}

/// A transport that reports rate-limit-exceeded as soon as more than
/// `budget` bytes have been written.
struct CappedTransport {
    inner: Vec<u8>,
    written: usize,
    budget: usize,
}

impl Transport for CappedTransport {
    fn put_byte(&mut self, b: u8) -> io::Result<()> {
        self.inner.push(b);
        self.written += 1;
        Ok(())
    }
    fn put_be16(&mut self, v: u16) -> io::Result<()> {
        self.inner.extend_from_slice(&v.to_be_bytes());
        self.written += 2;
        Ok(())
    }
    fn put_be32(&mut self, v: u32) -> io::Result<()> {
        self.inner.extend_from_slice(&v.to_be_bytes());
        self.written += 4;
        Ok(())
    }
    fn put_be64(&mut self, v: u64) -> io::Result<()> {
        self.inner.extend_from_slice(&v.to_be_bytes());
        self.written += 8;
        Ok(())
    }
    fn put_bytes(&mut self, b: &[u8]) -> io::Result<()> {
        self.inner.extend_from_slice(b);
        self.written += b.len();
        Ok(())
    }
    fn get_byte(&mut self) -> io::Result<u8> {
        unimplemented!("send-only transport")
    }
    fn get_be16(&mut self) -> io::Result<u16> {
        unimplemented!("send-only transport")
    }
    fn get_be32(&mut self) -> io::Result<u32> {
        unimplemented!("send-only transport")
    }
    fn get_be64(&mut self) -> io::Result<u64> {
        unimplemented!("send-only transport")
    }
    fn get_bytes(&mut self, _n: usize) -> io::Result<Vec<u8>> {
        unimplemented!("send-only transport")
    }
    fn rate_limit_exceeded(&self) -> bool {
        self.written > self.budget
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn scan_stops_once_rate_limited() {
    let pages = PACING_CHECK_STRIDE * 4;
    let len = pages * PAGE;
    let bytes = vec![7u8; len as usize];
    let mem = Arc::new(TestMemory {
        region: Region {
            id: RegionId::new("ram0").unwrap(),
            used_length: len,
            max_length: len,
            page_size: PAGE,
            migratable: true,
        },
        bytes: StdMutex::new(bytes),
    });

    let mut engine = Engine::new(Config::default(), mem);
    let mut t = CappedTransport {
        inner: Vec::new(),
        written: 0,
        budget: (PAGE as usize) * 2,
    };
    engine.setup(&mut t).unwrap();

    match engine.iterate(&mut t, pages).unwrap() {
        ScanOutcome::Paced { pages_sent } => {
            assert!(pages_sent > 0, "should have sent at least one page before tripping");
            assert!(
                pages_sent < pages,
                "rate limiting should have stopped the scan before covering every page"
            );
            assert_eq!(
                pages_sent % PACING_CHECK_STRIDE,
                0,
                "pacing is only checked every PACING_CHECK_STRIDE pages"
            );
        }
        ScanOutcome::Exhausted { .. } => panic!("expected the scan to be paced, not exhausted"),
    }
}
