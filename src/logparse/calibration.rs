// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsing of calibration blocks.
//!
//! Two independent scans of the same log family:
//!
//! - `* Begin/End calibration of Light frames` blocks give the master
//!   dark/flat/bias applied to a batch of lights, plus the list of
//!   calibrated output files written after the End marker.
//! - `* Begin/End calibration of Flat frames` followed by
//!   `* Begin/End integration of Flat frames` pairs link a produced master
//!   flat back to the master bias used to calibrate its flats.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use super::{read_log_lines, strip_timestamp, LogParseError};

/// One parsed "calibration of Light frames" block.
#[derive(Debug, Clone, Default)]
pub struct CalibrationBlock {
    /// `None` when the block's enabled flag was false or no path was found.
    pub master_dark: Option<PathBuf>,
    pub master_flat: Option<PathBuf>,
    /// Bias has no enabled flag; any found path is accepted.
    pub master_bias: Option<PathBuf>,
    /// Calibrated output files (`_c` suffixed) written from this block.
    pub calibrated_paths: Vec<PathBuf>,
}

/// Links a produced master flat to the master bias that calibrated its
/// flats. Blocks with both paths empty are discarded by the parser.
#[derive(Debug, Clone, Default)]
pub struct FlatBlock {
    pub master_flat: Option<PathBuf>,
    pub master_bias: Option<PathBuf>,
}

lazy_static! {
    static ref RE_LIGHT_BEGIN: Regex =
        Regex::new(r"\* Begin calibration of Light frames").unwrap();
    static ref RE_LIGHT_END: Regex = Regex::new(r"\* End calibration of Light frames").unwrap();
    static ref RE_CAL_FRAME: Regex =
        Regex::new(r"Calibration frame \d+:\s*.+\s*--->\s*(.+\.xisf)").unwrap();
    static ref RE_DARK_ENABLED: Regex =
        Regex::new(r"IC\.masterDarkEnabled\s*=\s*(true|false)").unwrap();
    static ref RE_FLAT_ENABLED: Regex =
        Regex::new(r"IC\.masterFlatEnabled\s*=\s*(true|false)").unwrap();
    static ref RE_DARK_PATH: Regex =
        Regex::new(r#"IC\.masterDarkPath\s*=\s*"([^"]+)""#).unwrap();
    static ref RE_FLAT_PATH: Regex =
        Regex::new(r#"IC\.masterFlatPath\s*=\s*"([^"]+)""#).unwrap();
    static ref RE_BIAS_PATH: Regex =
        Regex::new(r#"IC\.masterBiasPath\s*=\s*"([^"]+)""#).unwrap();
    static ref RE_BIAS_SUMMARY: Regex = Regex::new(r"Master bias:\s*(.+\.xisf)").unwrap();
    static ref RE_FLAT_CAL_BEGIN: Regex =
        Regex::new(r"\* Begin calibration of Flat frames").unwrap();
    static ref RE_FLAT_CAL_END: Regex = Regex::new(r"\* End calibration of Flat frames").unwrap();
    static ref RE_FLAT_INT_BEGIN: Regex =
        Regex::new(r"\* Begin integration of Flat frames").unwrap();
    static ref RE_FLAT_INT_END: Regex = Regex::new(r"\* End integration of Flat frames").unwrap();
    static ref RE_ADD_MASTER: Regex = Regex::new(r"Add the master file:\s*(.+\.xisf)").unwrap();
}

/// Extracts every light-calibration block from a log file, in source order.
pub fn parse_light_cal_blocks(path: &Path) -> Result<Vec<CalibrationBlock>, LogParseError> {
    let lines = read_log_lines(path)?;
    let n = lines.len();

    let mut blocks = Vec::new();
    let mut i = 0;
    while i < n {
        if !RE_LIGHT_BEGIN.is_match(&strip_timestamp(&lines[i])) {
            i += 1;
            continue;
        }

        let end = (i + 1..n).find(|&j| RE_LIGHT_END.is_match(&strip_timestamp(&lines[j])));
        let end = match end {
            Some(e) => e,
            None => {
                warn!(
                    "{}: no End marker for Light calibration block at line {i}",
                    path.display()
                );
                break;
            }
        };
        debug!("Light calibration block: lines {i}\u{2013}{end}");

        let mut blk = parse_light_cal_block(&lines[i..=end]);

        // The per-frame output summary follows the End marker, up to the
        // next block of the same kind.
        for line in &lines[end + 1..] {
            let s = strip_timestamp(line);
            if RE_LIGHT_BEGIN.is_match(&s) || RE_LIGHT_END.is_match(&s) {
                break;
            }
            if let Some(c) = RE_CAL_FRAME.captures(&s) {
                blk.calibrated_paths.push(PathBuf::from(c[1].trim()));
            }
        }
        debug!(
            "Light calibration block: dark={:?} flat={:?} bias={:?} outputs={}",
            blk.master_dark,
            blk.master_flat,
            blk.master_bias,
            blk.calibrated_paths.len()
        );

        blocks.push(blk);
        i = end + 1;
    }

    Ok(blocks)
}

// Extracts the master paths from a single Begin..End light-calibration
// block. A dark/flat path is retained only while its enabled flag is true;
// if the flag ends up false the path is cleared even when a path line
// matched earlier.
fn parse_light_cal_block(lines: &[String]) -> CalibrationBlock {
    let mut blk = CalibrationBlock::default();
    let mut dark_enabled = false;
    let mut flat_enabled = false;

    for raw in lines {
        let s = strip_timestamp(raw);

        if let Some(c) = RE_DARK_ENABLED.captures(&s) {
            dark_enabled = &c[1] == "true";
        }
        if let Some(c) = RE_FLAT_ENABLED.captures(&s) {
            flat_enabled = &c[1] == "true";
        }

        if dark_enabled && blk.master_dark.is_none() {
            if let Some(c) = RE_DARK_PATH.captures(&s) {
                blk.master_dark = Some(PathBuf::from(c[1].trim()));
            }
        }
        if flat_enabled && blk.master_flat.is_none() {
            if let Some(c) = RE_FLAT_PATH.captures(&s) {
                blk.master_flat = Some(PathBuf::from(c[1].trim()));
            }
        }
        if blk.master_bias.is_none() {
            // An explicit path assignment wins over the human-readable
            // summary line; the literal value "none" is rejected.
            if let Some(c) = RE_BIAS_PATH.captures(&s) {
                blk.master_bias = Some(PathBuf::from(c[1].trim()));
            } else if let Some(c) = RE_BIAS_SUMMARY.captures(&s) {
                let candidate = c[1].trim();
                if !candidate.is_empty() && !candidate.eq_ignore_ascii_case("none") {
                    blk.master_bias = Some(PathBuf::from(candidate));
                }
            }
        }
    }

    if !dark_enabled {
        blk.master_dark = None;
    }
    if !flat_enabled {
        blk.master_flat = None;
    }
    blk
}

/// Extracts every flat calibration+integration pair from a log file.
pub fn parse_flat_blocks(path: &Path) -> Result<Vec<FlatBlock>, LogParseError> {
    let lines = read_log_lines(path)?;
    let n = lines.len();

    let mut result = Vec::new();
    let mut flat_idx = 0;
    let mut i = 0;
    while i < n {
        if !RE_FLAT_CAL_BEGIN.is_match(&strip_timestamp(&lines[i])) {
            i += 1;
            continue;
        }

        let cal_end = (i + 1..n).find(|&j| RE_FLAT_CAL_END.is_match(&strip_timestamp(&lines[j])));
        let cal_end = match cal_end {
            Some(e) => e,
            None => {
                warn!(
                    "{}: flat block {flat_idx}: no calibration End marker",
                    path.display()
                );
                break;
            }
        };

        let mut blk = FlatBlock {
            master_bias: flat_cal_bias(&lines[i..=cal_end]),
            master_flat: None,
        };

        // The matching integration block must follow before any further
        // flat-calibration Begin; otherwise this pair is incomplete.
        let int_begin = (cal_end + 1..n)
            .map(|j| (j, strip_timestamp(&lines[j]).into_owned()))
            .find_map(|(j, s)| {
                if RE_FLAT_CAL_BEGIN.is_match(&s) {
                    Some(None)
                } else if RE_FLAT_INT_BEGIN.is_match(&s) {
                    Some(Some(j))
                } else {
                    None
                }
            })
            .flatten();

        match int_begin {
            Some(ib) => {
                let int_end =
                    (ib + 1..n).find(|&j| RE_FLAT_INT_END.is_match(&strip_timestamp(&lines[j])));
                match int_end {
                    Some(ie) => {
                        // The master-flat path sometimes lands a few lines
                        // after the End marker; widen the window by up to 10
                        // lines, stopping at any new Begin.
                        let mut window: Vec<&String> = lines[ib..=ie].iter().collect();
                        for line in lines.iter().take(n.min(ie + 10)).skip(ie + 1) {
                            let s = strip_timestamp(line);
                            if RE_FLAT_CAL_BEGIN.is_match(&s) || RE_FLAT_INT_BEGIN.is_match(&s) {
                                break;
                            }
                            window.push(line);
                        }
                        blk.master_flat = flat_integration_master(&window);
                        i = ie + 1;
                    }
                    None => {
                        warn!(
                            "{}: flat block {flat_idx}: integration End marker not found",
                            path.display()
                        );
                        i = ib + 1;
                    }
                }
            }
            None => {
                warn!(
                    "{}: flat block {flat_idx}: no integration block follows",
                    path.display()
                );
                i = cal_end + 1;
            }
        }

        if blk.master_flat.is_some() || blk.master_bias.is_some() {
            debug!(
                "Flat block {flat_idx}: flat={:?} bias={:?}",
                blk.master_flat, blk.master_bias
            );
            result.push(blk);
        } else {
            debug!("Flat block {flat_idx} discarded (both paths empty)");
        }
        flat_idx += 1;
    }

    Ok(result)
}

// The bias used inside a flat-calibration block, with the same two-pattern
// priority as the light-calibration scan.
fn flat_cal_bias(lines: &[String]) -> Option<PathBuf> {
    for raw in lines {
        let s = strip_timestamp(raw);
        if let Some(c) = RE_BIAS_PATH.captures(&s) {
            return Some(PathBuf::from(c[1].trim()));
        }
        if let Some(c) = RE_BIAS_SUMMARY.captures(&s) {
            let v = c[1].trim();
            if !v.is_empty() && !v.eq_ignore_ascii_case("none") {
                return Some(PathBuf::from(v));
            }
        }
    }
    None
}

// The master-flat output path of a flat-integration block: either the next
// non-blank line after a "Writing master Flat frame" marker (when it ends in
// .xisf), or an "Add the master file: path" line. First match wins.
fn flat_integration_master(lines: &[&String]) -> Option<PathBuf> {
    let mut next_line_is_path = false;
    for raw in lines {
        let s = strip_timestamp(raw);
        let s = s.trim();
        if next_line_is_path {
            if !s.is_empty() && s.ends_with(".xisf") {
                return Some(PathBuf::from(s));
            }
            next_line_is_path = false;
        }
        if s.contains("Writing master Flat frame") {
            next_line_is_path = true;
            continue;
        }
        if let Some(c) = RE_ADD_MASTER.captures(s) {
            return Some(PathBuf::from(c[1].trim()));
        }
    }
    None
}
