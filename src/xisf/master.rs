// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Extracts the integrated-frame count from a master dark/flat/bias XISF.
//!
//! The count has been written three different ways over the producing tool's
//! history:
//!
//! 1. A literal `<table id="images" rows="N">` element in the XML header.
//! 2. The same element entity-encoded inside a processing-history property
//!    attribute, so the raw bytes contain
//!    `&lt;table id=&quot;images&quot; rows=&quot;N&quot;&gt;`.
//! 3. A legacy FITS HISTORY comment `ImageIntegration.numberOfImages: N`.
//!
//! All three are tried in order against at most [SCAN_BYTES] of the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use lazy_static::lazy_static;
use log::trace;
use regex::Regex;

use super::read_envelope;

/// How much of the file is inspected, envelope included.
pub const SCAN_BYTES: u64 = 256 * 1024;

lazy_static! {
    static ref RE_TABLE: Regex = Regex::new(r"(?i)<table\b[^>]*>").unwrap();
    static ref RE_ID_ATTR: Regex = Regex::new(r#"(?i)\bid\s*=\s*"([^"]*)""#).unwrap();
    static ref RE_ROWS_ATTR: Regex = Regex::new(r#"(?i)\brows\s*=\s*"([^"]*)""#).unwrap();
    static ref RE_ENCODED: Regex =
        Regex::new(r"(?i)&lt;table\s+id=&quot;images&quot;\s+rows=&quot;(\d+)&quot;").unwrap();
    static ref RE_HISTORY: Regex =
        Regex::new(r"ImageIntegration\.numberOfImages:\s*(\d+)").unwrap();
}

/// Reads the frame count from a master XISF file, or `None` if the file is
/// unreadable, not an XISF container, or holds no recognisable count.
pub fn read_frame_count(path: &Path) -> Option<u32> {
    let mut f = File::open(path).ok()?;
    let xml_len = read_envelope(&mut f)?;

    if xml_len > 0 && u64::from(xml_len) <= SCAN_BYTES {
        // The declared XML header fits the budget; scan it first.
        let mut xml = Vec::with_capacity(xml_len as usize);
        (&mut f)
            .take(u64::from(xml_len))
            .read_to_end(&mut xml)
            .ok()?;
        if xml.len() == xml_len as usize {
            if let Some(n) = scan_chunk(&xml) {
                trace!("{}: count {n} found in XML header", path.display());
                return Some(n);
            }
        }
        // Not in the header; scan whatever raw bytes remain in the budget.
        let remain = SCAN_BYTES.saturating_sub(16 + xml.len() as u64);
        if remain > 0 {
            let mut extra = Vec::new();
            (&mut f).take(remain).read_to_end(&mut extra).ok()?;
            if !extra.is_empty() {
                if let Some(n) = scan_chunk(&extra) {
                    trace!("{}: count {n} found past XML header", path.display());
                    return Some(n);
                }
            }
        }
    } else {
        // Header absent or larger than the budget: scan raw bytes.
        let mut bulk = Vec::new();
        (&mut f).take(SCAN_BYTES - 16).read_to_end(&mut bulk).ok()?;
        if !bulk.is_empty() {
            if let Some(n) = scan_chunk(&bulk) {
                trace!("{}: count {n} found in raw scan", path.display());
                return Some(n);
            }
        }
    }

    None
}

// Tries all known encodings of the count against one chunk of bytes. A count
// of 0 is treated as no match.
fn scan_chunk(data: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(data);

    for m in RE_TABLE.find_iter(&text) {
        let element = m.as_str();
        let id = RE_ID_ATTR.captures(element).map(|c| c[1].to_string());
        if !id.is_some_and(|id| id.eq_ignore_ascii_case("images")) {
            continue;
        }
        if let Some(rows) = RE_ROWS_ATTR.captures(element) {
            if let Ok(n) = rows[1].parse::<u32>() {
                if n > 0 {
                    return Some(n);
                }
            }
        }
    }

    if let Some(c) = RE_ENCODED.captures(&text) {
        if let Ok(n) = c[1].parse::<u32>() {
            if n > 0 {
                return Some(n);
            }
        }
    }

    if let Some(c) = RE_HISTORY.captures(&text) {
        if let Ok(n) = c[1].parse::<u32>() {
            if n > 0 {
                return Some(n);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xisf::test_support::{write_xisf, write_xisf_with_len};

    #[test]
    fn literal_table_element() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(
            &path,
            br#"<xisf><table id="images" rows="42" columns="3"/></xisf>"#,
        );
        assert_eq!(read_frame_count(&path), Some(42));
    }

    #[test]
    fn table_attribute_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(&path, br#"<xisf><table rows="7" id="images"/></xisf>"#);
        assert_eq!(read_frame_count(&path), Some(7));
    }

    #[test]
    fn entity_encoded_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(
            &path,
            br#"<xisf><Property id="PixInsight:ProcessingHistory" value="&lt;table id=&quot;images&quot; rows=&quot;42&quot;&gt;"/></xisf>"#,
        );
        assert_eq!(read_frame_count(&path), Some(42));
    }

    #[test]
    fn legacy_history_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(
            &path,
            br#"<xisf><FITSKeyword name="HISTORY" value="" comment="ImageIntegration.numberOfImages: 25"/></xisf>"#,
        );
        assert_eq!(read_frame_count(&path), Some(25));
    }

    #[test]
    fn zero_rows_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(&path, br#"<xisf><table id="images" rows="0"/></xisf>"#);
        assert_eq!(read_frame_count(&path), None);
    }

    #[test]
    fn wrong_table_id_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        write_xisf(&path, br#"<xisf><table id="thumbs" rows="9"/></xisf>"#);
        assert_eq!(read_frame_count(&path), None);
    }

    #[test]
    fn bad_magic_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notxisf.bin");
        std::fs::write(&path, b"FITS0100 something else entirely").unwrap();
        assert_eq!(read_frame_count(&path), None);
    }

    #[test]
    fn oversized_header_falls_back_to_raw_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        // Declared length beyond the scan budget; the count is still present
        // within the first SCAN_BYTES of raw data.
        write_xisf_with_len(
            &path,
            10 * 1024 * 1024,
            br#"<xisf><table id="images" rows="12"/></xisf>"#,
        );
        assert_eq!(read_frame_count(&path), Some(12));
    }

    #[test]
    fn count_after_header_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.xisf");
        // A well-formed header without the table, followed by attached data
        // containing the legacy form.
        let xml = br#"<xisf version="1.0"></xisf>"#;
        write_xisf(&path, xml);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        f.write_all(b"...ImageIntegration.numberOfImages: 18...")
            .unwrap();
        assert_eq!(read_frame_count(&path), Some(18));
    }
}
