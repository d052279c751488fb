// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Frame resolution: reading the header of every registered frame in every
//! group, locating files that have moved.
//!
//! Resolution order for each missing file:
//!
//! 1. Primary cache: exact directories where a file was previously found.
//! 2. Secondary cache: search roots, searched recursively.
//! 3. Auto-probe: the `../registered/` sibling of the group's log file.
//! 4. The injected [DirectoryPrompt], blocking until answered.
//!
//! Any directory newly discovered to contain a match triggers a group-wide
//! remap, since frames from the same integration block are almost always
//! colocated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use super::{file_name_of, find_recursive, sibling_dir, DirectoryPrompt, ResolutionContext};
use crate::group::AcquisitionGroup;
use crate::xisf::{read_frame_header, FrameHeader};

/// Resolves every unresolved frame of every group, filling per-frame state
/// from the headers. `progress` is called with the running frame count after
/// every frame, whether resolved, skipped or cancelled. Designed to run on a
/// dedicated worker thread; it is the only writer to per-frame fields while
/// active.
pub fn resolve_frames<P: DirectoryPrompt + ?Sized>(
    groups: &mut [AcquisitionGroup],
    ctx: &mut ResolutionContext,
    prompt: &P,
    cancel: &AtomicBool,
    mut progress: impl FnMut(usize),
) {
    let mut done = 0;
    for grp in groups.iter_mut() {
        let mut group_skipped = false;

        for i in 0..grp.paths.len() {
            done += 1;
            if cancel.load(Ordering::Acquire) || group_skipped {
                progress(done);
                continue;
            }
            // Already-resolved frames are left untouched: no I/O, no prompts.
            if grp.frames[i].resolved {
                progress(done);
                continue;
            }

            let header = resolve_one(grp, i, ctx, prompt, cancel, &mut group_skipped);

            grp.frames[i].resolved = header.is_some();
            if let Some(h) = header {
                apply_header(grp, i, h);
            }
            progress(done);
        }
    }
}

// Runs the tier chain for one frame. May rewrite paths across the whole
// group when a new directory is discovered.
fn resolve_one<P: DirectoryPrompt + ?Sized>(
    grp: &mut AcquisitionGroup,
    i: usize,
    ctx: &mut ResolutionContext,
    prompt: &P,
    cancel: &AtomicBool,
    group_skipped: &mut bool,
) -> Option<FrameHeader> {
    let mut header = read_frame_header(&grp.paths[i]);

    // Tier 1: primary cache, exact-directory lookup. Only consulted when the
    // recorded file is gone; a present-but-unreadable file is not searched
    // for elsewhere.
    if header.is_none() && !grp.paths[i].exists() {
        let fname = file_name_of(&grp.paths[i]);
        let hit = ctx
            .primary
            .iter()
            .find(|dir| dir.join(&fname).is_file())
            .cloned();
        if let Some(dir) = hit {
            trace!("{fname}: found via primary cache in {}", dir.display());
            remap_group(grp, &dir, ctx);
            header = read_frame_header(&grp.paths[i]);
        }
    }

    // Tier 2: secondary cache, depth-limited recursive search.
    if header.is_none() && !grp.paths[i].exists() {
        let fname = file_name_of(&grp.paths[i]);
        let roots = ctx.secondary.clone();
        for root in roots {
            if cancel.load(Ordering::Acquire) {
                break;
            }
            if let Some(found) = find_recursive(&root, &fname, Some(cancel)) {
                trace!("{fname}: found via secondary cache at {}", found.display());
                let found_dir = found.parent().map(Path::to_path_buf).unwrap_or(root);
                ctx.record_hit_dir(found_dir.clone());
                remap_group(grp, &found_dir, ctx);
                header = read_frame_header(&grp.paths[i]);
                break;
            }
        }
    }

    // Tier 3: the ../registered/ sibling of the log file, the producing
    // tool's standard output layout.
    if header.is_none() && !grp.paths[i].exists() && !cancel.load(Ordering::Acquire) {
        let fname = file_name_of(&grp.paths[i]);
        if let Some(reg) = sibling_dir(&grp.source_log, "registered") {
            if let Some(found) = find_recursive(&reg, &fname, Some(cancel)) {
                debug!("{fname}: found via registered sibling at {}", found.display());
                let found_dir = found.parent().map(Path::to_path_buf).unwrap_or(reg);
                ctx.record_hit_dir(found_dir.clone());
                ctx.secondary.push(found_dir.clone());
                remap_group(grp, &found_dir, ctx);
                header = read_frame_header(&grp.paths[i]);
            }
        }
    }

    // Tier 4: ask. A decline skips the remaining frames of this group.
    if header.is_none() && !grp.paths[i].exists() && !cancel.load(Ordering::Acquire) {
        let start_dir = grp
            .source_log
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        match prompt.request_directory(&grp.paths[i], &start_dir) {
            None => {
                debug!(
                    "prompt declined for {}; skipping rest of group",
                    grp.paths[i].display()
                );
                *group_skipped = true;
            }
            Some(supplied) => {
                let fname = file_name_of(&grp.paths[i]);
                ctx.secondary.push(supplied.clone());
                if let Some(found) = find_recursive(&supplied, &fname, Some(cancel)) {
                    let found_dir = found.parent().map(Path::to_path_buf).unwrap_or(supplied);
                    ctx.record_hit_dir(found_dir.clone());
                    remap_group(grp, &found_dir, ctx);
                    header = read_frame_header(&grp.paths[i]);
                }
            }
        }
    }

    header
}

// Speculatively rewrites every frame path of the group to the newly-known
// directory (or wherever the caches locate it). Frames from one integration
// block are almost always colocated, so this usually saves all the remaining
// per-frame searches.
fn remap_group(grp: &mut AcquisitionGroup, known_dir: &Path, ctx: &ResolutionContext) {
    for j in 0..grp.paths.len() {
        let fname = file_name_of(&grp.paths[j]);

        let candidate = known_dir.join(&fname);
        if candidate.is_file() {
            grp.paths[j] = candidate;
            continue;
        }
        if let Some(dir) = ctx.primary.iter().find(|d| d.join(&fname).is_file()) {
            grp.paths[j] = dir.join(&fname);
            continue;
        }
        if let Some(hit) = ctx
            .secondary
            .iter()
            .find_map(|d| find_recursive(d, &fname, None))
        {
            grp.paths[j] = hit;
        }
    }
}

fn apply_header(grp: &mut AcquisitionGroup, i: usize, h: FrameHeader) {
    grp.frames[i].date = h.date;
    grp.frames[i].gain = h.gain;
    grp.frames[i].sensor_temp = h.sensor_temp;
    grp.frames[i].ambient_temp = h.ambient_temp;

    // The first resolved frame reporting a FILTER keyword overrides the
    // log-derived filter, once.
    if let Some(filter) = h.filter {
        if !grp.filter_from_header {
            grp.filter = filter;
            grp.filter_from_header = true;
        }
    }

    // OBJECT promotes to the group target only when no log keyword claimed
    // it and no earlier header did.
    if let Some(object) = h.object {
        if matches!(grp.target, crate::group::TargetSource::None) {
            grp.target = crate::group::TargetSource::FrameHeader(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::TargetSource;
    use crate::xisf::test_support::write_xisf;
    use std::cell::Cell;
    use std::sync::atomic::AtomicBool;
    use vec1::Vec1;

    fn frame_xml(date: &str, filter: &str, object: &str) -> Vec<u8> {
        format!(
            r#"<xisf>
<FITSKeyword name="DATE-LOC" value="'{date}'"/>
<FITSKeyword name="GAIN" value="100"/>
<FITSKeyword name="SET-TEMP" value="-10.0"/>
<FITSKeyword name="FILTER" value="'{filter}'"/>
<FITSKeyword name="OBJECT" value="'{object}'"/>
<FITSKeyword name="AMBTEMP" value="3.5"/>
</xisf>"#
        )
        .into_bytes()
    }

    fn group_with_paths(log: &Path, paths: Vec<PathBuf>) -> AcquisitionGroup {
        AcquisitionGroup::new(log, Vec1::try_from_vec(paths).unwrap())
    }

    /// A prompt double returning one canned answer, panicking if consulted
    /// more than once.
    struct OneShotPrompt {
        answer: Option<PathBuf>,
        used: Cell<bool>,
    }

    impl DirectoryPrompt for OneShotPrompt {
        fn request_directory(&self, _missing: &Path, _start: &Path) -> Option<PathBuf> {
            assert!(!self.used.replace(true), "prompt consulted twice");
            self.answer.clone()
        }
    }

    /// A prompt double that panics when consulted at all.
    struct NeverPrompt;

    impl DirectoryPrompt for NeverPrompt {
        fn request_directory(&self, missing: &Path, _start: &Path) -> Option<PathBuf> {
            panic!("unexpected prompt for {}", missing.display());
        }
    }

    #[test]
    fn resolves_frames_at_recorded_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xisf");
        let b = dir.path().join("b.xisf");
        write_xisf(&a, &frame_xml("2024-03-15T22:00:00", "Ha", "NGC 7000"));
        write_xisf(&b, &frame_xml("2024-03-16T01:00:00", "Ha", "NGC 7000"));

        let log = dir.path().join("session.log");
        let mut groups = vec![group_with_paths(&log, vec![a, b])];
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);
        let mut ticks = Vec::new();

        resolve_frames(&mut groups, &mut ctx, &NeverPrompt, &cancel, |n| {
            ticks.push(n)
        });

        let g = &groups[0];
        assert!(g.all_frames_resolved());
        assert_eq!(ticks, vec![1, 2]);
        // Both frames belong to the same observing night.
        assert_eq!(g.frames[0].date, g.frames[1].date);
        assert_eq!(g.frames[0].gain, Some(100));
        // Filter came from the first frame header, once.
        assert_eq!(g.filter, "Ha");
        assert!(g.filter_from_header);
        assert_eq!(g.target, TargetSource::FrameHeader("NGC 7000".to_string()));
    }

    #[test]
    fn log_keyword_target_survives_object_headers() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xisf");
        write_xisf(&a, &frame_xml("2024-03-15T22:00:00", "Ha", "ngc7000 panel2"));

        let log = dir.path().join("session.log");
        let mut groups = vec![group_with_paths(&log, vec![a])];
        groups[0].target = TargetSource::LogKeyword("NGC 7000 mosaic".to_string());
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);

        resolve_frames(&mut groups, &mut ctx, &NeverPrompt, &cancel, |_| {});

        assert_eq!(
            groups[0].target,
            TargetSource::LogKeyword("NGC 7000 mosaic".to_string())
        );
    }

    #[test]
    fn moved_files_are_found_via_supplied_directory_and_group_remapped() {
        let dir = tempfile::tempdir().unwrap();
        let actual = dir.path().join("moved/deep");
        std::fs::create_dir_all(&actual).unwrap();
        for name in ["a.xisf", "b.xisf", "c.xisf"] {
            write_xisf(
                &actual.join(name),
                &frame_xml("2024-03-15T22:00:00", "L", "M 31"),
            );
        }

        let log = dir.path().join("session.log");
        let stale: Vec<PathBuf> = ["a.xisf", "b.xisf", "c.xisf"]
            .iter()
            .map(|n| PathBuf::from("/gone").join(n))
            .collect();
        let mut groups = vec![group_with_paths(&log, stale)];
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);
        let prompt = OneShotPrompt {
            answer: Some(dir.path().join("moved")),
            used: Cell::new(false),
        };

        resolve_frames(&mut groups, &mut ctx, &prompt, &cancel, |_| {});

        let g = &groups[0];
        assert!(g.all_frames_resolved());
        // The group-wide remap rewrote every path, so only one prompt was
        // needed (OneShotPrompt would have panicked otherwise).
        for (i, name) in ["a.xisf", "b.xisf", "c.xisf"].iter().enumerate() {
            assert_eq!(g.paths[i], actual.join(name));
        }
        // The discovered directory is cached for later imports.
        assert!(ctx.primary.contains(&actual));
    }

    #[test]
    fn registered_sibling_is_probed() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let registered = dir.path().join("registered");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::create_dir_all(&registered).unwrap();
        write_xisf(
            &registered.join("a.xisf"),
            &frame_xml("2024-03-15T22:00:00", "L", "M 31"),
        );

        let log = logs.join("session.log");
        let mut groups = vec![group_with_paths(&log, vec![PathBuf::from("/gone/a.xisf")])];
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);

        resolve_frames(&mut groups, &mut ctx, &NeverPrompt, &cancel, |_| {});

        assert!(groups[0].all_frames_resolved());
        assert_eq!(groups[0].paths[0], registered.join("a.xisf"));
    }

    #[test]
    fn declined_prompt_skips_rest_of_group() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let stale: Vec<PathBuf> = (0..3)
            .map(|i| PathBuf::from(format!("/gone/f{i}.xisf")))
            .collect();
        let mut groups = vec![group_with_paths(&log, stale)];
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);
        let prompt = OneShotPrompt {
            answer: None,
            used: Cell::new(false),
        };
        let mut ticks = 0;

        resolve_frames(&mut groups, &mut ctx, &prompt, &cancel, |_| ticks += 1);

        // One prompt for the first frame; the rest were skipped without
        // prompting, but progress still ticked for each.
        assert_eq!(ticks, 3);
        assert!(groups[0].frames.iter().all(|f| !f.resolved));
    }

    #[test]
    fn cancellation_skips_all_io_and_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let stale: Vec<PathBuf> = (0..4)
            .map(|i| PathBuf::from(format!("/gone/f{i}.xisf")))
            .collect();
        let mut groups = vec![group_with_paths(&log, stale)];
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(true);
        let mut ticks = 0;

        resolve_frames(&mut groups, &mut ctx, &NeverPrompt, &cancel, |_| ticks += 1);

        assert_eq!(ticks, 4);
        assert!(groups[0].frames.iter().all(|f| !f.resolved));
    }

    #[test]
    fn second_pass_over_resolved_group_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        // Paths that no longer exist; if any I/O or prompting were attempted
        // the NeverPrompt would fire.
        let mut groups = vec![group_with_paths(&log, vec![PathBuf::from("/gone/a.xisf")])];
        groups[0].frames[0].resolved = true;
        groups[0].frames[0].gain = Some(139);
        let before = groups[0].clone();
        let mut ctx = ResolutionContext::new();
        let cancel = AtomicBool::new(false);

        resolve_frames(&mut groups, &mut ctx, &NeverPrompt, &cancel, |_| {});

        assert_eq!(groups[0].frames, before.frames);
        assert_eq!(groups[0].paths, before.paths);
    }
}
