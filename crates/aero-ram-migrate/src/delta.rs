//! XBZRLE-style delta encoding: a page is described as an alternating
//! sequence of (unchanged-run-length, changed-run-length, changed-bytes)
//! triples relative to a cached base page.
//!
//! The caller (`ram_xbzrle.c`) of this codec was available for study but
//! the codec body itself (`xbzrle.c`) was not part of the retrieval pack,
//! so the exact byte layout below is this crate's own reconstruction of
//! the documented run-length scheme, fixed once here and used consistently
//! by both `encode` and `decode` (see DESIGN.md Open Questions).

/// Outcome of attempting to encode `new` against `old`.
#[derive(Debug, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// `new == old`; nothing was written.
    Identical,
    /// The encoded form would not fit in the destination buffer (in
    /// practice: would not be smaller than sending the page raw). The
    /// caller should fall back to `save_normal_page`.
    Overflow,
    /// `n` bytes of encoded delta were written to the destination.
    Encoded(usize),
}

/// Writes an unsigned varint (continuation-bit, little-endian groups of 7
/// bits) and returns the number of bytes written, or `None` if `out` was
/// too small.
fn write_varint(out: &mut [u8], pos: &mut usize, mut v: u32) -> Option<()> {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        *out.get_mut(*pos)? = byte;
        *pos += 1;
        if v == 0 {
            return Some(());
        }
    }
}

fn read_varint(input: &[u8], pos: &mut usize) -> Option<u32> {
    let mut v: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *input.get(*pos)?;
        *pos += 1;
        v |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
        if shift >= 32 {
            return None;
        }
    }
}

/// Encodes `new` relative to `old` into `out`. Both inputs must be the
/// same length (one target page). Returns `Overflow` as soon as the
/// encoded size would meet or exceed `new.len()`, since a delta that big
/// is never worth sending over the raw page.
pub fn encode(old: &[u8], new: &[u8], out: &mut [u8]) -> EncodeOutcome {
    debug_assert_eq!(old.len(), new.len());
    if old == new {
        return EncodeOutcome::Identical;
    }

    let mut pos = 0usize;
    let mut i = 0usize;
    let n = new.len();

    while i < n {
        let zrun_start = i;
        while i < n && old[i] == new[i] {
            i += 1;
        }
        let zrun_len = (i - zrun_start) as u32;
        if write_varint(out, &mut pos, zrun_len).is_none() {
            return EncodeOutcome::Overflow;
        }

        let nzrun_start = i;
        while i < n && old[i] != new[i] {
            i += 1;
        }
        let nzrun_len = (i - nzrun_start) as u32;
        if write_varint(out, &mut pos, nzrun_len).is_none() {
            return EncodeOutcome::Overflow;
        }
        if nzrun_len > 0 {
            let end = pos + nzrun_len as usize;
            if end > out.len() {
                return EncodeOutcome::Overflow;
            }
            out[pos..end].copy_from_slice(&new[nzrun_start..i]);
            pos = end;
        }

        if pos >= n {
            return EncodeOutcome::Overflow;
        }
    }

    EncodeOutcome::Encoded(pos)
}

/// Reconstructs a page from `old` and an encoded delta, writing into
/// `out` (which must be `old.len()` bytes). Returns an error if the
/// stream is malformed or does not exactly cover `out.len()` bytes.
pub fn decode(old: &[u8], encoded: &[u8], out: &mut [u8]) -> Result<(), ()> {
    debug_assert_eq!(old.len(), out.len());
    let n = out.len();
    let mut pos = 0usize;
    let mut i = 0usize;

    while i < n {
        let zrun = read_varint(encoded, &mut pos).ok_or(())? as usize;
        if i + zrun > n {
            return Err(());
        }
        out[i..i + zrun].copy_from_slice(&old[i..i + zrun]);
        i += zrun;

        let nzrun = read_varint(encoded, &mut pos).ok_or(())? as usize;
        if i + nzrun > n {
            return Err(());
        }
        let src_end = pos + nzrun;
        let src = encoded.get(pos..src_end).ok_or(())?;
        out[i..i + nzrun].copy_from_slice(src);
        pos = src_end;
        i += nzrun;
    }

    Ok(())
}
