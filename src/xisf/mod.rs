// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Readers for the XISF binary container format.
//!
//! An XISF file starts with a 16-byte envelope: the 8-byte magic signature
//! `XISF0100`, a little-endian u32 giving the length of the embedded XML
//! header, and 4 reserved bytes. The XML header follows immediately.
//!
//! Nothing in this module returns an error for malformed input; a file that
//! is not an XISF container (or is truncated) simply yields `None`. Callers
//! decide whether that is worth a warning.

pub mod frame;
pub mod master;

pub use frame::{read_frame_header, FrameHeader};
pub use master::read_frame_count;

use std::fs::File;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

pub(crate) const XISF_MAGIC: &[u8; 8] = b"XISF0100";

/// Validates the magic signature and returns the declared XML header length,
/// leaving the file cursor at the first header byte. `None` means "not this
/// format".
pub(crate) fn read_envelope(f: &mut File) -> Option<u32> {
    let mut magic = [0u8; 8];
    f.read_exact(&mut magic).ok()?;
    if &magic != XISF_MAGIC {
        return None;
    }
    let xml_len = f.read_u32::<LittleEndian>().ok()?;
    let mut reserved = [0u8; 4];
    f.read_exact(&mut reserved).ok()?;
    Some(xml_len)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn envelope_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xisf");
        std::fs::write(&path, b"NOTXISF!\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        let mut f = File::open(&path).unwrap();
        assert!(read_envelope(&mut f).is_none());
    }

    #[test]
    fn envelope_reads_length_and_positions_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.xisf");
        test_support::write_xisf(&path, b"<xisf></xisf>");
        let mut f = File::open(&path).unwrap();
        assert_eq!(read_envelope(&mut f), Some(13));
        assert_eq!(f.stream_position().unwrap(), 16);
        // The header follows immediately.
        let mut rest = String::new();
        f.seek(SeekFrom::Start(16)).unwrap();
        f.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "<xisf></xisf>");
    }

    #[test]
    fn envelope_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.xisf");
        std::fs::write(&path, b"XISF0100\x10").unwrap();
        let mut f = File::open(&path).unwrap();
        assert!(read_envelope(&mut f).is_none());
    }
}
