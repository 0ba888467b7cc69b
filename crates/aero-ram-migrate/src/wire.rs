//! The self-describing binary frame format tying sender and receiver
//! together. Every frame is one big-endian 64-bit word packing a
//! target-page-aligned offset with flags in the low bits the alignment
//! leaves free, matching `RAM_SAVE_FLAG_*`'s layout in `ram_xbzrle.c`.

use crate::error::{MigrateError, ProtocolError};
use crate::region::{Region, RegionId};
use crate::transport::Transport;
use crate::TARGET_PAGE_SIZE;

/// Version of the wire format this crate speaks. Not itself transmitted
/// (the handshake in §4.7/S1 carries no version word) -- the constant
/// documents which revision of the frame layout this crate implements,
/// matching the source's `.version_id = 4` being a build-time fact about
/// `ram_mig_init` rather than a byte the core stream negotiates.
pub const PROTOCOL_VERSION: u32 = 4;

/// Tag byte preceding an XBZRLE payload, mirroring `ENCODING_FLAG_XBZRLE`.
const ENCODING_FLAG_XBZRLE: u8 = 0x01;

bitflags::bitflags! {
    /// Bit values fixed by the wire spec. The low 12 bits of a frame word
    /// are free for flags because every offset is `TARGET_PAGE_SIZE`
    /// (4 KiB) aligned; `0x01` is the source's obsolete per-page-zlib bit
    /// and is never emitted. `DISCARD` and `MULTIFD_SYNC` are this crate's
    /// own additions, placed on bits the spec table leaves unused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WireFlags: u16 {
        /// Page is all-zero; followed by one fill-value byte (always 0).
        const ZERO            = 0x02;
        /// Initiates the region-list handshake; the word's aligned part
        /// carries total RAM bytes rather than an offset.
        const MEM_SIZE        = 0x04;
        /// Raw uncompressed `TARGET_PAGE_SIZE`-byte payload follows.
        const PAGE            = 0x08;
        /// End of the region's page stream; no payload.
        const EOS             = 0x10;
        /// Omit the region id; reuse the previous frame's region.
        const CONTINUE        = 0x20;
        /// XBZRLE-encoded delta: tag byte + 16-bit length + payload.
        const XBZRLE          = 0x40;
        /// Post-copy discard range `[offset, offset+length)`, this
        /// crate's addition for `postcopy_send_discard_bitmap`.
        const DISCARD         = 0x80;
        /// Deflate-compressed payload, 32-bit length-prefixed, follows.
        const COMPRESS_PAGE   = 0x100;
        /// Multifd/background-scan synchronization barrier, this crate's
        /// addition, no payload.
        const MULTIFD_SYNC    = 0x200;
    }
}

const FLAG_MASK: u64 = TARGET_PAGE_SIZE - 1;

const PAGE_KIND_MASK: WireFlags = WireFlags::ZERO
    .union(WireFlags::PAGE)
    .union(WireFlags::XBZRLE)
    .union(WireFlags::COMPRESS_PAGE)
    .union(WireFlags::DISCARD);

/// Packs a target-page-aligned offset (or, for the `MEM_SIZE` frame, the
/// total-bytes field) together with flags into one wire word. Page
/// offsets are always alignment-clean; the `MEM_SIZE` total is ORed in
/// the same way the wire spec defines it, without assuming alignment.
fn pack(aligned: u64, flags: WireFlags) -> u64 {
    aligned | flags.bits() as u64
}

/// Splits a wire word back into its aligned field and flags, rejecting
/// any bit the spec doesn't assign meaning to.
fn unpack(word: u64) -> Result<(u64, WireFlags), MigrateError> {
    let flag_bits = (word & FLAG_MASK) as u16;
    let flags = WireFlags::from_bits(flag_bits).ok_or(ProtocolError::UnknownFlags(word))?;
    Ok((word & !FLAG_MASK, flags))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Zero {
        region: RegionId,
        offset: u64,
    },
    Raw {
        region: RegionId,
        offset: u64,
        data: Vec<u8>,
    },
    Xbzrle {
        region: RegionId,
        offset: u64,
        data: Vec<u8>,
    },
    Compressed {
        region: RegionId,
        offset: u64,
        data: Vec<u8>,
    },
    Discard {
        region: RegionId,
        offset: u64,
        length: u64,
    },
    MultifdSync,
    Eos,
}

/// Carries the `CONTINUE` bookkeeping across frames for one direction of
/// the stream.
#[derive(Default)]
pub struct FrameCursor {
    last_region: Option<RegionId>,
}

impl FrameCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The region the most recently written/read data frame named,
    /// whether directly or via `CONTINUE`. Used by the scanner's boundary
    /// rule (§4.6 item 2) to detect a region switch without keeping a
    /// second, divergent copy of the same bookkeeping.
    pub fn last_region(&self) -> Option<&RegionId> {
        self.last_region.as_ref()
    }
}

/// Writes the setup-phase handshake (§4.7, scenario S1): one `MEM_SIZE`
/// frame word carrying the sum of every migratable region's
/// `used_length`, then one flat `(id-len, id, used_length, [page_size])`
/// record per region in `regions` order, terminated by an `EOS` word.
/// `postcopy_advised` gates whether a region whose `page_size` differs
/// from `TARGET_PAGE_SIZE` also sends its `page_size`.
pub fn write_mem_size_handshake(
    t: &mut dyn Transport,
    regions: &[Region],
    postcopy_advised: bool,
) -> Result<(), MigrateError> {
    let migratable: Vec<&Region> = regions.iter().filter(|r| r.migratable).collect();
    let total_bytes: u64 = migratable.iter().map(|r| r.used_length).sum();
    t.put_be64(pack(total_bytes, WireFlags::MEM_SIZE))?;
    for r in &migratable {
        let id_bytes = r.id.as_str().as_bytes();
        t.put_byte(id_bytes.len() as u8)?;
        t.put_bytes(id_bytes)?;
        t.put_be64(r.used_length)?;
        if postcopy_advised && r.page_size != TARGET_PAGE_SIZE {
            t.put_be64(r.page_size)?;
        }
    }
    t.put_be64(pack(0, WireFlags::EOS))?;
    Ok(())
}

/// Reads and validates the handshake written by [`write_mem_size_handshake`]
/// against `local_regions` (the receiver's own region catalog), returning
/// the peer-declared total RAM byte count. The receiver is assumed to
/// already know its own region list out of band (the same migratable VM
/// configuration on both ends), so the record count needed to find the
/// terminating `EOS` word is `local_regions`'s migratable count, not
/// anything carried on the wire.
pub fn read_mem_size_handshake(
    t: &mut dyn Transport,
    local_regions: &[Region],
    postcopy_advised: bool,
) -> Result<u64, MigrateError> {
    let word = t.get_be64()?;
    let (total_bytes, flags) = unpack(word)?;
    if !flags.contains(WireFlags::MEM_SIZE) {
        return Err(ProtocolError::UnknownFlags(word).into());
    }

    for r in local_regions.iter().filter(|r| r.migratable) {
        let len = t.get_byte()? as usize;
        let id_bytes = t.get_bytes(len)?;
        let id = RegionId::new(String::from_utf8_lossy(&id_bytes).into_owned())?;
        if id != r.id {
            return Err(ProtocolError::UnknownRegion(id.to_string()).into());
        }
        let used_length = t.get_be64()?;
        if used_length != r.used_length {
            return Err(ProtocolError::RegionLengthMismatch {
                region: id.to_string(),
                local: r.used_length,
                remote: used_length,
            }
            .into());
        }
        if postcopy_advised && r.page_size != TARGET_PAGE_SIZE {
            let page_size = t.get_be64()?;
            if page_size != r.page_size {
                return Err(ProtocolError::RegionPageSizeMismatch {
                    region: id.to_string(),
                    local: r.page_size,
                    remote: page_size,
                }
                .into());
            }
        }
    }

    let eos_word = t.get_be64()?;
    let (_, eos_flags) = unpack(eos_word)?;
    if !eos_flags.contains(WireFlags::EOS) {
        return Err(ProtocolError::UnknownFlags(eos_word).into());
    }
    Ok(total_bytes)
}

pub fn write_frame(
    t: &mut dyn Transport,
    cursor: &mut FrameCursor,
    frame: &Frame,
) -> Result<(), MigrateError> {
    match frame {
        Frame::Eos => {
            t.put_be64(pack(0, WireFlags::EOS))?;
        }
        Frame::MultifdSync => {
            t.put_be64(pack(0, WireFlags::MULTIFD_SYNC))?;
        }
        Frame::Zero { region, offset } => {
            write_region_header(t, cursor, *offset, WireFlags::ZERO, region)?;
            t.put_byte(0)?;
        }
        Frame::Raw { region, offset, data } => {
            debug_assert_eq!(data.len(), TARGET_PAGE_SIZE as usize);
            write_region_header(t, cursor, *offset, WireFlags::PAGE, region)?;
            t.put_bytes(data)?;
        }
        Frame::Xbzrle { region, offset, data } => {
            write_region_header(t, cursor, *offset, WireFlags::XBZRLE, region)?;
            t.put_byte(ENCODING_FLAG_XBZRLE)?;
            t.put_be16(data.len() as u16)?;
            t.put_bytes(data)?;
        }
        Frame::Compressed { region, offset, data } => {
            write_region_header(t, cursor, *offset, WireFlags::COMPRESS_PAGE, region)?;
            t.put_be32(data.len() as u32)?;
            t.put_bytes(data)?;
        }
        Frame::Discard { region, offset, length } => {
            write_region_header(t, cursor, *offset, WireFlags::DISCARD, region)?;
            t.put_be64(*length)?;
        }
    }
    Ok(())
}

fn write_region_header(
    t: &mut dyn Transport,
    cursor: &mut FrameCursor,
    offset: u64,
    kind: WireFlags,
    region: &RegionId,
) -> Result<(), MigrateError> {
    let continue_flag = cursor.last_region.as_ref() == Some(region);
    let mut flags = kind;
    if continue_flag {
        flags |= WireFlags::CONTINUE;
    }
    t.put_be64(pack(offset, flags))?;
    if !continue_flag {
        let bytes = region.as_str().as_bytes();
        t.put_byte(bytes.len() as u8)?;
        t.put_bytes(bytes)?;
    }
    cursor.last_region = Some(region.clone());
    Ok(())
}

pub fn read_frame(t: &mut dyn Transport, cursor: &mut FrameCursor) -> Result<Frame, MigrateError> {
    let word = t.get_be64()?;
    let (offset, flags) = unpack(word)?;

    if flags.contains(WireFlags::EOS) {
        return Ok(Frame::Eos);
    }
    if flags.contains(WireFlags::MULTIFD_SYNC) {
        return Ok(Frame::MultifdSync);
    }
    if flags.contains(WireFlags::MEM_SIZE) {
        return Err(ProtocolError::UnknownFlags(word).into());
    }

    let kind = flags & PAGE_KIND_MASK;
    if kind.bits().count_ones() != 1 {
        return Err(ProtocolError::UnknownFlags(word).into());
    }

    let region = if flags.contains(WireFlags::CONTINUE) {
        cursor.last_region.clone().ok_or(ProtocolError::UnknownFlags(word))?
    } else {
        let len = t.get_byte()? as usize;
        let bytes = t.get_bytes(len)?;
        let id = String::from_utf8_lossy(&bytes).into_owned();
        RegionId::new(id)?
    };
    cursor.last_region = Some(region.clone());

    let frame = if kind == WireFlags::ZERO {
        let _fill = t.get_byte()?;
        Frame::Zero { region, offset }
    } else if kind == WireFlags::PAGE {
        let data = t.get_bytes(TARGET_PAGE_SIZE as usize)?;
        Frame::Raw { region, offset, data }
    } else if kind == WireFlags::XBZRLE {
        let tag = t.get_byte()?;
        if tag != ENCODING_FLAG_XBZRLE {
            return Err(ProtocolError::UnknownFlags(tag as u64).into());
        }
        let len = t.get_be16()? as usize;
        let data = t.get_bytes(len)?;
        Frame::Xbzrle { region, offset, data }
    } else if kind == WireFlags::COMPRESS_PAGE {
        let len = t.get_be32()? as usize;
        let data = t.get_bytes(len)?;
        Frame::Compressed { region, offset, data }
    } else {
        let length = t.get_be64()?;
        Frame::Discard { region, offset, length }
    };
    Ok(frame)
}

impl From<ProtocolError> for MigrateError {
    fn from(e: ProtocolError) -> Self {
        MigrateError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;

    fn region(id: &str, used_length: u64, page_size: u64) -> Region {
        Region {
            id: RegionId::new(id).unwrap(),
            used_length,
            max_length: used_length,
            page_size,
            migratable: true,
        }
    }

    /// Scenario S1: one region `"pc.ram"`, `used_length = 8192`,
    /// `page_size = 4096`, postcopy not advised.
    #[test]
    fn s1_handshake_matches_documented_bytes() {
        let regions = vec![region("pc.ram", 8192, 4096)];
        let mut t = MemTransport::new();
        write_mem_size_handshake(&mut t, &regions, false).unwrap();
        let bytes = t.into_inner();

        let mut expected = Vec::new();
        expected.extend_from_slice(&(8192u64 | 0x04).to_be_bytes());
        expected.push(6); // len("pc.ram")
        expected.extend_from_slice(b"pc.ram");
        expected.extend_from_slice(&8192u64.to_be_bytes());
        expected.extend_from_slice(&0x10u64.to_be_bytes());
        assert_eq!(bytes, expected);

        let mut r = MemTransport::from_bytes(bytes);
        let total = read_mem_size_handshake(&mut r, &regions, false).unwrap();
        assert_eq!(total, 8192);
    }

    /// Scenario S2: one zero page, one raw page, then `EOS`.
    #[test]
    fn s2_zero_then_raw_then_eos_matches_documented_bytes() {
        let region_id = RegionId::new("pc.ram").unwrap();
        let mut t = MemTransport::new();
        let mut wc = FrameCursor::new();
        write_frame(&mut t, &mut wc, &Frame::Zero { region: region_id.clone(), offset: 0 }).unwrap();
        write_frame(
            &mut t,
            &mut wc,
            &Frame::Raw {
                region: region_id.clone(),
                offset: 0x1000,
                data: vec![7u8; TARGET_PAGE_SIZE as usize],
            },
        )
        .unwrap();
        write_frame(&mut t, &mut wc, &Frame::Eos).unwrap();
        let bytes = t.into_inner();

        let mut expected = Vec::new();
        expected.extend_from_slice(&(0u64 | 0x02).to_be_bytes());
        expected.push(6);
        expected.extend_from_slice(b"pc.ram");
        expected.push(0x00); // ZERO fill byte
        expected.extend_from_slice(&(0x1000u64 | 0x08 | 0x20).to_be_bytes());
        expected.extend(std::iter::repeat(7u8).take(TARGET_PAGE_SIZE as usize));
        expected.extend_from_slice(&0x10u64.to_be_bytes());
        assert_eq!(bytes, expected);

        let mut r = MemTransport::from_bytes(bytes);
        let mut rc = FrameCursor::new();
        assert_eq!(read_frame(&mut r, &mut rc).unwrap(), Frame::Zero { region: region_id.clone(), offset: 0 });
        match read_frame(&mut r, &mut rc).unwrap() {
            Frame::Raw { region: rg, offset, data } => {
                assert_eq!(rg, region_id);
                assert_eq!(offset, 0x1000);
                assert_eq!(data, vec![7u8; TARGET_PAGE_SIZE as usize]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(read_frame(&mut r, &mut rc).unwrap(), Frame::Eos);
    }

    #[test]
    fn continue_flag_omits_region_id_on_wire() {
        let region_id = RegionId::new("a-pretty-long-region-name").unwrap();
        let mut wc = FrameCursor::new();

        let mut t = MemTransport::new();
        write_frame(&mut t, &mut wc, &Frame::Zero { region: region_id.clone(), offset: 0 }).unwrap();
        let first_frame_len = t.into_inner().len();

        let mut t2 = MemTransport::new();
        write_frame(&mut t2, &mut wc, &Frame::Zero { region: region_id.clone(), offset: 4096 }).unwrap();
        let second_frame_bytes = t2.into_inner();

        // first frame: 8-byte word + len-prefixed region id + 1-byte fill
        assert_eq!(first_frame_len, 8 + 1 + region_id.as_str().len() + 1);
        // second frame (CONTINUE): 8-byte word + 1-byte fill only
        assert_eq!(second_frame_bytes.len(), 8 + 1);
        let word = u64::from_be_bytes(second_frame_bytes[0..8].try_into().unwrap());
        assert!(unpack(word).unwrap().1.contains(WireFlags::CONTINUE));
    }

    #[test]
    fn xbzrle_frame_uses_tag_byte_and_16_bit_length() {
        let region_id = RegionId::new("pc.ram").unwrap();
        let mut wc = FrameCursor::new();
        let mut t = MemTransport::new();
        write_frame(
            &mut t,
            &mut wc,
            &Frame::Xbzrle { region: region_id.clone(), offset: 0, data: vec![1, 2, 3] },
        )
        .unwrap();
        let bytes = t.into_inner();
        // word(8) + id-len(1) + id(6) + tag(1) + be16-len(2) + payload(3)
        assert_eq!(bytes.len(), 8 + 1 + 6 + 1 + 2 + 3);
        assert_eq!(bytes[8 + 1 + 6], ENCODING_FLAG_XBZRLE);
        let len = u16::from_be_bytes([bytes[8 + 1 + 6 + 1], bytes[8 + 1 + 6 + 2]]);
        assert_eq!(len, 3);

        let mut r = MemTransport::from_bytes(bytes);
        let mut rc = FrameCursor::new();
        match read_frame(&mut r, &mut rc).unwrap() {
            Frame::Xbzrle { data, .. } => assert_eq!(data, vec![1, 2, 3]),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn conflicting_page_kind_bits_are_rejected() {
        let mut t = MemTransport::new();
        t.put_be64((WireFlags::ZERO | WireFlags::PAGE).bits() as u64).unwrap();
        let mut rc = FrameCursor::new();
        assert!(read_frame(&mut t, &mut rc).is_err());
    }

    #[test]
    fn unknown_flag_bit_is_rejected() {
        let mut t = MemTransport::new();
        t.put_be64(0x01).unwrap(); // obsolete bit, never valid on its own
        let mut rc = FrameCursor::new();
        assert!(read_frame(&mut t, &mut rc).is_err());
    }
}
