// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-frame acquisition metadata from an XISF header.
//!
//! Six FITS keywords are of interest: DATE-LOC, GAIN, SET-TEMP, FILTER,
//! OBJECT and AMBTEMP. Everything except DATE-LOC is optional; a frame
//! without a capture date cannot be placed in a session and fails the read.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use log::{trace, warn};
use regex::Regex;

use super::read_envelope;

/// Upper bound on the declared XML header length.
const MAX_HEADER_BYTES: u32 = 10 * 1024 * 1024;

/// Metadata read from one acquired frame. Consumed immediately by the frame
/// resolver; not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// The session date the frame belongs to. 12 hours are subtracted from
    /// the capture timestamp before taking the date, so a frame captured
    /// just after local midnight is attributed to the previous night.
    /// `None` when the DATE-LOC value was present but unparseable; a frame
    /// with no DATE-LOC keyword at all fails the whole read instead.
    pub date: Option<NaiveDate>,
    pub gain: Option<i32>,
    pub sensor_temp: Option<i32>,
    pub ambient_temp: Option<f64>,
    pub filter: Option<String>,
    pub object: Option<String>,
}

lazy_static! {
    static ref RE_FITS_KEYWORD: Regex = Regex::new(r"(?is)<FITSKeyword\b[^>]*>").unwrap();
    static ref RE_NAME_ATTR: Regex = Regex::new(r#"(?i)\bname\s*=\s*"([^"]*)""#).unwrap();
    static ref RE_VALUE_ATTR: Regex = Regex::new(r#"(?i)\bvalue\s*=\s*"([^"]*)""#).unwrap();
}

/// Reads the acquisition metadata of a single frame, or `None` if the file
/// is unreadable, not an XISF container, or carries no DATE-LOC keyword.
pub fn read_frame_header(path: &Path) -> Option<FrameHeader> {
    let mut f = File::open(path).ok()?;
    let xml_len = read_envelope(&mut f)?;
    if xml_len == 0 || xml_len > MAX_HEADER_BYTES {
        return None;
    }

    let mut xml = Vec::with_capacity(xml_len as usize);
    (&mut f)
        .take(u64::from(xml_len))
        .read_to_end(&mut xml)
        .ok()?;
    if xml.len() < xml_len as usize {
        return None;
    }
    let text = String::from_utf8_lossy(&xml);

    let mut date_loc: Option<String> = None;
    let mut gain_raw: Option<String> = None;
    let mut set_temp_raw: Option<String> = None;
    let mut filter_raw: Option<String> = None;
    let mut object_raw: Option<String> = None;
    let mut amb_temp_raw: Option<String> = None;

    for m in RE_FITS_KEYWORD.find_iter(&text) {
        let element = m.as_str();
        let name = match RE_NAME_ATTR.captures(element) {
            Some(c) => c[1].trim().to_ascii_uppercase(),
            None => continue,
        };
        let value = RE_VALUE_ATTR
            .captures(element)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        // First occurrence wins for every keyword.
        match name.as_str() {
            "DATE-LOC" if date_loc.is_none() => date_loc = Some(value),
            "GAIN" if gain_raw.is_none() => gain_raw = Some(value),
            "SET-TEMP" if set_temp_raw.is_none() => set_temp_raw = Some(value),
            "FILTER" if filter_raw.is_none() => filter_raw = Some(value),
            "OBJECT" if object_raw.is_none() => object_raw = Some(value),
            "AMBTEMP" if amb_temp_raw.is_none() => amb_temp_raw = Some(value),
            _ => {}
        }

        if date_loc.is_some()
            && gain_raw.is_some()
            && set_temp_raw.is_some()
            && filter_raw.is_some()
            && object_raw.is_some()
            && amb_temp_raw.is_some()
        {
            break;
        }
    }

    let date_loc = match date_loc {
        Some(d) => d,
        None => {
            trace!("{}: DATE-LOC absent, frame skipped", path.display());
            return None;
        }
    };

    let date = parse_capture_date(&date_loc);
    if date.is_none() {
        warn!(
            "{}: could not parse DATE-LOC value '{}'",
            path.display(),
            date_loc
        );
    }

    Some(FrameHeader {
        date,
        gain: gain_raw.as_deref().and_then(parse_rounded_int),
        sensor_temp: set_temp_raw.as_deref().and_then(parse_rounded_int),
        ambient_temp: amb_temp_raw
            .as_deref()
            .and_then(|s| strip_quotes(s).parse::<f64>().ok()),
        filter: filter_raw.as_deref().map(strip_quotes).filter(|s| !s.is_empty()),
        object: object_raw.as_deref().map(strip_quotes).filter(|s| !s.is_empty()),
    })
}

// FITS string values are surrounded by single quotes; strip one layer.
fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    let t = t.strip_prefix('\'').unwrap_or(t);
    let t = t.strip_suffix('\'').unwrap_or(t);
    t.trim().to_string()
}

fn parse_rounded_int(s: &str) -> Option<i32> {
    strip_quotes(s).parse::<f64>().ok().map(|v| v.round() as i32)
}

// Strict ISO-8601 with fractional seconds first, then without. On success the
// timestamp is shifted back 12 hours so the date component identifies the
// observing night, not the calendar day.
fn parse_capture_date(raw: &str) -> Option<NaiveDate> {
    let s = strip_quotes(raw);
    let dt = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Some((dt - Duration::hours(12)).date())
}
