// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The long-lived aggregate produced by log parsing: one [AcquisitionGroup]
//! per light-frame integration block, carrying per-frame state that the
//! resolvers fill in.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use vec1::Vec1;

/// Where an acquisition group's target name came from. A target matched from
/// a user-defined keyword in the log takes priority and must never be
/// overwritten by a frame header's OBJECT value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSource {
    #[default]
    None,
    LogKeyword(String),
    FrameHeader(String),
}

impl TargetSource {
    pub fn name(&self) -> Option<&str> {
        match self {
            TargetSource::None => None,
            TargetSource::LogKeyword(s) | TargetSource::FrameHeader(s) => Some(s.as_str()),
        }
    }

    pub fn is_from_log(&self) -> bool {
        matches!(self, TargetSource::LogKeyword(_))
    }
}

/// Per-frame resolution state. All fields start empty and are populated by
/// the frame resolver from the frame's header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameState {
    pub resolved: bool,
    pub date: Option<NaiveDate>,
    pub gain: Option<i32>,
    pub sensor_temp: Option<i32>,
    pub ambient_temp: Option<f64>,
}

/// One light-frame integration block from a stacking-session log.
#[derive(Debug, Clone)]
pub struct AcquisitionGroup {
    pub filter: String,
    /// Set when `filter` was overwritten from the first resolved frame header
    /// reporting a FILTER keyword; this happens at most once per group.
    pub filter_from_header: bool,
    pub exposure_sec: f64,
    pub binning: u32,
    pub target: TargetSource,
    /// The log file this group was parsed from.
    pub source_log: PathBuf,
    /// Registered-frame paths as recorded in the log. The resolvers may
    /// rewrite these when the files have moved.
    pub paths: Vec1<PathBuf>,
    /// Parallel to `paths`; always the same length.
    pub frames: Vec<FrameState>,
    /// Calibration frame counts; `None` means unknown or not applicable.
    pub darks: Option<u32>,
    pub flats: Option<u32>,
    pub bias: Option<u32>,
}

impl AcquisitionGroup {
    pub(crate) fn new(source_log: &Path, paths: Vec1<PathBuf>) -> AcquisitionGroup {
        let frames = vec![FrameState::default(); paths.len()];
        AcquisitionGroup {
            filter: String::new(),
            filter_from_header: false,
            exposure_sec: 0.0,
            binning: 1,
            target: TargetSource::None,
            source_log: source_log.to_path_buf(),
            paths,
            frames,
            darks: None,
            flats: None,
            bias: None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.paths.len()
    }

    pub fn all_frames_resolved(&self) -> bool {
        self.frames.iter().all(|f| f.resolved)
    }

    /// A human-readable label for warnings: the target name if known,
    /// otherwise the stem of the source log file.
    pub fn label(&self) -> String {
        match self.target.name() {
            Some(t) => t.to_string(),
            None => self
                .source_log
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}
