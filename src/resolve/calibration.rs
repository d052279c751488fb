// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Calibration resolution: matching acquisition groups to their calibration
//! blocks and turning master-frame paths into frame counts.
//!
//! Groups are linked to blocks through filename correlation: each registered
//! frame name carries a `_c` infix marking the calibrated file it was
//! produced from, and the calibrated basenames are indexed across all parsed
//! blocks. Master paths then resolve to counts through a 5-tier location
//! chain, with a flat→bias link table (built from the flat blocks) taking
//! priority for the bias.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, warn};

use super::{file_name_of, find_recursive, sibling_dir, DirectoryPrompt, ResolutionContext};
use crate::group::AcquisitionGroup;
use crate::logparse::calibration::{parse_flat_blocks, parse_light_cal_blocks};
use crate::logparse::CalibrationBlock;
use crate::xisf::read_frame_count;

/// Collected, user-facing outcomes of a calibration resolution pass. None of
/// these are fatal; they are surfaced by the caller.
#[derive(Debug, Default)]
pub struct CalibrationReport {
    /// Group labels for which no calibration block could be matched.
    pub unmatched: Vec<String>,
    /// Master flats referenced by a light-calibration block but produced in
    /// a different session; their bias counts stay unresolved.
    pub external_flats: Vec<String>,
}

/// Resolves the dark/flat/bias counts of every group that is still missing
/// any of them. Only missing counts are filled, so loading a second log can
/// complete a group without overwriting values resolved earlier.
pub fn resolve_calibration<P: DirectoryPrompt + ?Sized>(
    groups: &mut [AcquisitionGroup],
    log_files: &[PathBuf],
    ctx: &mut ResolutionContext,
    prompt: &P,
) -> CalibrationReport {
    let mut report = CalibrationReport::default();

    let mut all_blocks: Vec<CalibrationBlock> = Vec::new();
    for lf in log_files {
        match parse_light_cal_blocks(lf) {
            Ok(blocks) => all_blocks.extend(blocks),
            Err(e) => warn!("{e}"),
        }
    }

    // Master flat (lowercased full path) → the bias that calibrated its
    // flats. Preferred over the bias recorded in a light-calibration block.
    let mut flat_to_bias: HashMap<String, PathBuf> = HashMap::new();
    let mut known_flat_basenames: HashSet<String> = HashSet::new();
    for lf in log_files {
        match parse_flat_blocks(lf) {
            Ok(blocks) => {
                for fb in blocks {
                    if let (Some(flat), Some(bias)) = (fb.master_flat, fb.master_bias) {
                        known_flat_basenames.insert(basename_key(&flat));
                        flat_to_bias.insert(path_key(&flat), bias);
                    }
                }
            }
            Err(e) => warn!("{e}"),
        }
    }

    if all_blocks.is_empty() {
        debug!("no calibration blocks found; nothing to resolve");
        return report;
    }

    // A master flat whose basename never appears among locally-produced
    // flats came from another session; its bias cannot be determined from
    // these logs. Known-unresolvable, surfaced but not an error.
    let mut external: HashSet<String> = HashSet::new();
    for blk in &all_blocks {
        if let Some(flat) = &blk.master_flat {
            if !known_flat_basenames.contains(&basename_key(flat)) {
                external.insert(file_name_of(flat));
            }
        }
    }
    for f in external.iter().sorted() {
        warn!("master flat from external session, bias count unavailable: {f}");
        report.external_flats.push(f.clone());
    }

    // Conventional sibling directories of each log.
    let log_to_calibrated: HashMap<&PathBuf, Option<PathBuf>> = log_files
        .iter()
        .map(|lf| (lf, sibling_dir(lf, "calibrated")))
        .collect();
    let log_to_master: HashMap<&PathBuf, Option<PathBuf>> = log_files
        .iter()
        .map(|lf| (lf, sibling_dir(lf, "master")))
        .collect();

    // Calibrated basename → block index, across all loaded logs.
    let mut basename_to_block: HashMap<String, usize> = HashMap::new();
    let mut calibrated_dir_cache: HashSet<PathBuf> = HashSet::new();
    for (b, blk) in all_blocks.iter().enumerate() {
        for cp in &blk.calibrated_paths {
            basename_to_block.insert(basename_key(cp), b);
            if let Some(dir) = cp.parent() {
                calibrated_dir_cache.insert(dir.to_path_buf());
            }
        }
    }
    debug!("{} calibrated basenames indexed", basename_to_block.len());

    let mut masters = MasterResolver {
        ctx,
        prompt,
        memo: HashMap::new(),
        skip_prompts: false,
    };

    for grp in groups.iter_mut() {
        // A group with darks and flats but no bias is still processed, so a
        // second log can fill in what the first was missing.
        if grp.darks.is_some() && grp.flats.is_some() && grp.bias.is_some() {
            continue;
        }

        let label = format!("{} / {}", grp.label(), grp.filter);
        let master_root = log_to_master.get(&grp.source_log).cloned().flatten();
        let calibrated_root = log_to_calibrated.get(&grp.source_log).cloned().flatten();

        let mut matched = false;
        for reg_path in grp.paths.iter() {
            let cal_base = match calibrated_basename(reg_path) {
                Some(b) => b,
                None => {
                    debug!("no _c suffix in {}", file_name_of(reg_path));
                    continue;
                }
            };

            let mut block_idx = basename_to_block.get(&cal_base.to_lowercase()).copied();

            if block_idx.is_none() {
                // Not indexed directly; look for the calibrated file on disk
                // and retry with the basename we actually find.
                let mut found: Option<PathBuf> = None;
                for dir in &calibrated_dir_cache {
                    let candidate = dir.join(&cal_base);
                    if candidate.is_file() {
                        found = Some(candidate);
                        break;
                    }
                }
                if found.is_none() {
                    if let Some(root) = &calibrated_root {
                        found = find_recursive(root, &cal_base, None);
                        if let Some(f) = &found {
                            if let Some(dir) = f.parent() {
                                calibrated_dir_cache.insert(dir.to_path_buf());
                            }
                        }
                    }
                }
                if let Some(f) = found {
                    block_idx = basename_to_block.get(&basename_key(&f)).copied();
                }
            }

            let blk = match block_idx {
                Some(b) => &all_blocks[b],
                None => continue,
            };

            if grp.darks.is_none() {
                grp.darks = masters.count(blk.master_dark.as_deref(), master_root.as_deref());
            }
            if grp.flats.is_none() {
                grp.flats = masters.count(blk.master_flat.as_deref(), master_root.as_deref());
            }
            if grp.bias.is_none() {
                if let Some(flat) = &blk.master_flat {
                    if let Some(bias) = flat_to_bias.get(&path_key(flat)) {
                        grp.bias = masters.count(Some(bias.as_path()), master_root.as_deref());
                    }
                }
                if grp.bias.is_none() {
                    grp.bias = masters.count(blk.master_bias.as_deref(), master_root.as_deref());
                }
            }

            debug!(
                "'{label}': darks={:?} flats={:?} bias={:?}",
                grp.darks, grp.flats, grp.bias
            );
            matched = true;
            break;
        }

        if !matched {
            warn!("no calibration block matched for '{label}'");
            report.unmatched.push(label);
        }
    }

    report
}

/// Derives the calibrated-file basename from a registered frame path.
///
/// The `_c` infix must be followed by the end of the stem or another
/// underscore, so `M31_001_c_r.xisf` maps to `M31_001_c.xisf` but
/// `M31_001_calibrated.xisf` does not match at all.
pub(crate) fn calibrated_basename(registered: &Path) -> Option<String> {
    let stem = registered.file_stem()?.to_string_lossy();
    for (pos, _) in stem.rmatch_indices("_c") {
        let after = pos + 2;
        if after == stem.len() || stem.as_bytes().get(after) == Some(&b'_') {
            return Some(format!("{}.xisf", &stem[..after]));
        }
    }
    None
}

fn basename_key(path: &Path) -> String {
    file_name_of(path).to_lowercase()
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

// Turns master paths into frame counts through the tiered location chain,
// memoising per path so each master file is read once per pass.
struct MasterResolver<'a, P: DirectoryPrompt + ?Sized> {
    ctx: &'a mut ResolutionContext,
    prompt: &'a P,
    memo: HashMap<PathBuf, Option<u32>>,
    // One cancellation suppresses every later prompt in this pass; without
    // this, a batch with many missing masters becomes a prompt storm.
    skip_prompts: bool,
}

impl<P: DirectoryPrompt + ?Sized> MasterResolver<'_, P> {
    fn count(&mut self, path: Option<&Path>, master_root: Option<&Path>) -> Option<u32> {
        let path = path?;
        if let Some(&memoised) = self.memo.get(path) {
            return memoised;
        }

        let fname = file_name_of(path);

        // Tier 1: the path recorded in the log.
        if path.is_file() {
            if let Some(n) = read_frame_count(path) {
                self.memo.insert(path.to_path_buf(), Some(n));
                return Some(n);
            }
        }

        // Tier 2: the ../master/ sibling of the log file.
        if let Some(root) = master_root {
            if let Some(found) = find_recursive(root, &fname, None) {
                let n = read_frame_count(&found);
                debug!(
                    "{fname}: not at recorded path, found at {} (count {n:?})",
                    found.display()
                );
                if let Some(dir) = found.parent() {
                    self.ctx.record_hit_dir(dir.to_path_buf());
                }
                self.memo.insert(found, n);
                self.memo.insert(path.to_path_buf(), n);
                return n;
            }
        }

        // Tier 3: primary cache, exact directories.
        for dir in &self.ctx.primary {
            let candidate = dir.join(&fname);
            if candidate.is_file() {
                if let Some(n) = read_frame_count(&candidate) {
                    self.memo.insert(path.to_path_buf(), Some(n));
                    return Some(n);
                }
            }
        }

        // Tier 4: secondary cache, recursive.
        let roots = self.ctx.secondary.clone();
        for dir in roots {
            if let Some(found) = find_recursive(&dir, &fname, None) {
                let n = read_frame_count(&found);
                if let Some(parent) = found.parent() {
                    self.ctx.record_hit_dir(parent.to_path_buf());
                }
                self.memo.insert(found, n);
                self.memo.insert(path.to_path_buf(), n);
                return n;
            }
        }

        // Tier 5: ask, with a retry loop while the chosen directory does not
        // contain the file.
        if !self.skip_prompts {
            let start_dir = master_root
                .map(Path::to_path_buf)
                .or_else(|| path.parent().map(Path::to_path_buf))
                .unwrap_or_default();
            loop {
                let supplied = match self.prompt.request_directory(path, &start_dir) {
                    Some(d) => d,
                    None => {
                        debug!("master prompt declined; suppressing further prompts");
                        self.skip_prompts = true;
                        break;
                    }
                };
                if let Some(found) = find_recursive(&supplied, &fname, None) {
                    let n = read_frame_count(&found);
                    if let Some(parent) = found.parent() {
                        self.ctx.record_hit_dir(parent.to_path_buf());
                    }
                    self.ctx.secondary.push(supplied);
                    self.memo.insert(found, n);
                    self.memo.insert(path.to_path_buf(), n);
                    return n;
                }
                warn!("'{fname}' not found in supplied directory; asking again");
            }
        }

        self.memo.insert(path.to_path_buf(), None);
        None
    }
}
