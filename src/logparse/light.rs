// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsing of light-frame integration blocks.
//!
//! Each `* Begin integration of Light frames` / `* End …` pair yields one
//! [AcquisitionGroup]. Two integration engine variants exist: the standard
//! engine introduces its image list with `II.images = [`, the fast engine
//! with `FI.targets = [`. The list entries are `[flag, "path"]` tuples and
//! only `.xisf` paths are taken.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use vec1::Vec1;

use super::{read_log_lines, strip_timestamp, LogParseError};
use crate::group::{AcquisitionGroup, TargetSource};

lazy_static! {
    static ref RE_BEGIN: Regex =
        Regex::new(r"\* Begin (?:fast )?integration of Light frames").unwrap();
    static ref RE_END: Regex =
        Regex::new(r"\* End (?:fast )?integration of Light frames").unwrap();
    static ref RE_FILTER: Regex = Regex::new(r"Filter\s*:\s*(.+)").unwrap();
    static ref RE_EXPOSURE: Regex = Regex::new(r"Exposure\s*:\s*([\d.]+)s").unwrap();
    static ref RE_BINNING: Regex = Regex::new(r"BINNING\s*:\s*(\d+)").unwrap();
    static ref RE_KEYWORDS: Regex = Regex::new(r"Keywords\s*:\s*\[(.+)\]").unwrap();
    static ref RE_IMAGES_BEGIN: Regex = Regex::new(r"II\.images\s*=\s*\[").unwrap();
    static ref RE_TARGETS_BEGIN: Regex = Regex::new(r"FI\.targets\s*=\s*\[").unwrap();
    static ref RE_PATH_TUPLE: Regex =
        Regex::new(r#"\[(?:true|false),\s*"([^"]+\.xisf)""#).unwrap();
}

/// Sniffs the first few lines for producer markers without parsing anything.
pub fn can_parse(path: &Path) -> bool {
    let lines = match read_log_lines(path) {
        Ok(l) => l,
        Err(_) => return false,
    };
    lines.iter().take(10).any(|l| {
        l.contains("PixInsight Core")
            || l.contains("Weighted Batch Preprocessing")
            || l.contains("fast integration")
    })
}

/// Extracts every light-integration block from a log file, in source order.
///
/// `target_keywords` is the user-configured list of keyword names whose value
/// names the target (e.g. `TARGET`); an empty list disables extraction and
/// the target must later come from frame headers.
pub fn parse_light_blocks(
    path: &Path,
    target_keywords: &[String],
) -> Result<Vec<AcquisitionGroup>, LogParseError> {
    let lines = read_log_lines(path)?;
    debug!("{}: {} lines", path.display(), lines.len());

    let mut groups = Vec::new();
    let mut block_idx = 0;
    let n = lines.len();
    let mut i = 0;
    while i < n {
        if !RE_BEGIN.is_match(&strip_timestamp(&lines[i])) {
            i += 1;
            continue;
        }

        let end = (i + 1..n).find(|&j| RE_END.is_match(&strip_timestamp(&lines[j])));
        let end = match end {
            Some(e) => e,
            None => {
                // Positions beyond an unclosed block are unreliable; stop
                // scanning for further blocks in this file.
                warn!(
                    "{}: no End marker for Light block {block_idx}; remainder skipped",
                    path.display()
                );
                break;
            }
        };
        debug!("Light block {block_idx}: lines {i}\u{2013}{end}");

        match parse_block(&lines[i..=end], path, target_keywords) {
            Some(grp) => {
                debug!(
                    "Light block {block_idx} accepted: target='{}' filter='{}' \
                     exposure={}s binning={} frames={}",
                    grp.target.name().unwrap_or("(none)"),
                    grp.filter,
                    grp.exposure_sec,
                    grp.binning,
                    grp.frame_count()
                );
                groups.push(grp);
            }
            None => warn!("Light block {block_idx} rejected (no .xisf paths found)"),
        }

        block_idx += 1;
        i = end + 1;
    }

    if groups.is_empty() {
        warn!("{}: no Light integration blocks found", path.display());
    }
    Ok(groups)
}

// Extracts one group from the lines of a closed Begin/End block. `None` when
// the block references no .xisf paths.
fn parse_block(
    lines: &[String],
    source_log: &Path,
    target_keywords: &[String],
) -> Option<AcquisitionGroup> {
    let mut filter = String::new();
    let mut exposure_sec = 0.0;
    let mut binning = 1;
    let mut target = TargetSource::None;
    let mut images_start: Option<usize> = None;

    for (i, raw) in lines.iter().enumerate() {
        let s = strip_timestamp(raw);

        if let Some(c) = RE_FILTER.captures(&s) {
            filter = c[1].trim().to_string();
        }
        if let Some(c) = RE_EXPOSURE.captures(&s) {
            exposure_sec = c[1].trim().parse().unwrap_or(0.0);
        }
        if let Some(c) = RE_BINNING.captures(&s) {
            binning = c[1].trim().parse().unwrap_or(1);
        }
        if RE_KEYWORDS.is_match(&s) {
            if let Some(t) = extract_target(&s, target_keywords) {
                target = TargetSource::LogKeyword(t);
            }
        }

        if images_start.is_none()
            && (RE_IMAGES_BEGIN.is_match(&s) || RE_TARGETS_BEGIN.is_match(&s))
        {
            images_start = Some(i);
        }
    }

    let paths = match images_start {
        Some(start) => extract_xisf_paths(lines, start),
        None => Vec::new(),
    };
    let paths = Vec1::try_from_vec(paths).ok()?;

    let mut grp = AcquisitionGroup::new(source_log, paths);
    grp.filter = filter;
    grp.exposure_sec = exposure_sec;
    grp.binning = binning;
    grp.target = target;
    Some(grp)
}

// Walks the image-list literal starting at `start`, collecting the quoted
// .xisf path of each tuple until the closing `];`.
fn extract_xisf_paths(lines: &[String], start: usize) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut in_array = false;
    for raw in &lines[start..] {
        let s = strip_timestamp(raw);
        if !in_array {
            if (s.contains("II.images") || s.contains("FI.targets")) && s.contains('[') {
                in_array = true;
            }
            continue;
        }
        if s.trim().starts_with("];") {
            break;
        }
        if let Some(c) = RE_PATH_TUPLE.captures(&s) {
            paths.push(PathBuf::from(&c[1]));
        }
    }
    paths
}

// Matches a `kw : value` pair inside a keywords line against the user's
// target-keyword names, case-insensitively. An empty list disables the
// feature.
fn extract_target(line: &str, keywords: &[String]) -> Option<String> {
    if keywords.is_empty() {
        return None;
    }
    let alternatives = keywords
        .iter()
        .map(|kw| regex::escape(kw))
        .collect::<Vec<_>>()
        .join("|");
    let re = RegexBuilder::new(&format!(r"(?:{alternatives})\s*:\s*([^\],]+)"))
        .case_insensitive(true)
        .build()
        .ok()?;
    re.captures(line)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::io::Write;

    fn write_log(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    const SIMPLE_LOG: &str = indoc! {r#"
        PixInsight Core 1.8.9
        [2024-03-15 22:01:09] * Begin integration of Light frames
        Filter   : Ha
        Exposure : 300.0s
        BINNING  : 1
        Keywords : [TARGET: NGC 7000, SESSION: 12]
        II.images = [ // enabled, path
        [true, "/data/reg/NGC7000_Ha_001_c_r.xisf"],
        [true, "/data/reg/NGC7000_Ha_002_c_r.xisf"],
        [false, "/data/reg/NGC7000_Ha_003_c_r.xisf"]
        ];
        * End integration of Light frames
    "#};

    #[test]
    fn one_block_one_group() {
        let (_dir, path) = write_log(SIMPLE_LOG);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.filter, "Ha");
        assert_eq!(g.exposure_sec, 300.0);
        assert_eq!(g.binning, 1);
        assert_eq!(g.frame_count(), 3);
        assert_eq!(g.frames.len(), 3);
        assert_eq!(
            g.paths[0],
            PathBuf::from("/data/reg/NGC7000_Ha_001_c_r.xisf")
        );
        // No target keywords configured, so nothing is extracted here.
        assert_eq!(g.target, TargetSource::None);
    }

    #[test]
    fn target_keyword_extraction() {
        let (_dir, path) = write_log(SIMPLE_LOG);
        let groups = parse_light_blocks(&path, &["TARGET".to_string()]).unwrap();
        assert_eq!(
            groups[0].target,
            TargetSource::LogKeyword("NGC 7000".to_string())
        );
        assert!(groups[0].target.is_from_log());
    }

    #[test]
    fn target_keyword_is_case_insensitive() {
        let (_dir, path) = write_log(SIMPLE_LOG);
        let groups = parse_light_blocks(&path, &["target".to_string()]).unwrap();
        assert_eq!(groups[0].target.name(), Some("NGC 7000"));
    }

    #[test]
    fn fast_integration_list_variant() {
        let log = indoc! {r#"
            * Begin fast integration of Light frames
            Filter   : OIII
            Exposure : 180.0s
            FI.targets = [
            [true, "/data/reg/M31_OIII_001_c_r.xisf"],
            [true, "/data/reg/M31_OIII_002_c_r.xisf"]
            ];
            * End fast integration of Light frames
        "#};
        let (_dir, path) = write_log(log);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].frame_count(), 2);
        assert_eq!(groups[0].filter, "OIII");
    }

    #[test]
    fn unterminated_block_aborts_the_scan() {
        let log = indoc! {r#"
            * Begin integration of Light frames
            Filter   : Ha
            II.images = [
            [true, "/data/a.xisf"]
            ];
            * Begin integration of Light frames
            Filter   : SII
        "#};
        // The first Begin finds the second Begin but never an End, so no
        // blocks at all are emitted.
        let (_dir, path) = write_log(log);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn empty_block_is_rejected_but_scanning_continues() {
        let log = indoc! {r#"
            * Begin integration of Light frames
            Filter   : L
            * End integration of Light frames
            * Begin integration of Light frames
            Filter   : R
            II.images = [
            [true, "/data/reg/M31_R_001_c_r.xisf"]
            ];
            * End integration of Light frames
        "#};
        let (_dir, path) = write_log(log);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].filter, "R");
    }

    #[test]
    fn blocks_come_out_in_source_order() {
        let log = format!(
            "{}\n{}",
            SIMPLE_LOG,
            indoc! {r#"
                * Begin integration of Light frames
                Filter   : SII
                Exposure : 600.0s
                II.images = [
                [true, "/data/reg/NGC7000_SII_001_c_r.xisf"]
                ];
                * End integration of Light frames
            "#}
        );
        let (_dir, path) = write_log(&log);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].filter, "Ha");
        assert_eq!(groups[1].filter, "SII");
    }

    #[test]
    fn non_xisf_entries_are_ignored() {
        let log = indoc! {r#"
            * Begin integration of Light frames
            II.images = [
            [true, "/data/reg/a.fits"],
            [true, "/data/reg/b.xisf"]
            ];
            * End integration of Light frames
        "#};
        let (_dir, path) = write_log(log);
        let groups = parse_light_blocks(&path, &[]).unwrap();
        assert_eq!(groups[0].frame_count(), 1);
        assert_eq!(groups[0].paths[0], PathBuf::from("/data/reg/b.xisf"));
    }

    #[test]
    fn sniffs_producer_markers() {
        let (_dir, path) = write_log(SIMPLE_LOG);
        assert!(can_parse(&path));
        let (_dir2, other) = write_log("some unrelated file\nwith two lines\n");
        assert!(!can_parse(&other));
    }
}
