// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Locating files that have moved since the log was written.
//!
//! Both resolvers share a tiered strategy: exact-directory cache, recursive
//! search of user-supplied roots, a conventionally-named sibling directory
//! of the log file, and finally a human prompt. The caches live in a
//! [ResolutionContext] owned by the caller and persist across imports, so a
//! directory supplied once keeps paying off.

pub mod calibration;
pub mod frames;

pub use calibration::{resolve_calibration, CalibrationReport};
pub use frames::resolve_frames;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use log::trace;

/// Hard bound on recursive directory search.
pub const MAX_SEARCH_DEPTH: usize = 4;

/// Mutable location caches shared by the resolvers.
///
/// `primary` holds exact directories where a wanted file was previously
/// found; `secondary` holds roots (user-supplied or discovered) that are
/// searched recursively. Both are read-mostly during a resolution pass and
/// persist for the session.
#[derive(Debug, Default)]
pub struct ResolutionContext {
    pub(crate) primary: HashSet<PathBuf>,
    pub(crate) secondary: Vec<PathBuf>,
}

impl ResolutionContext {
    pub fn new() -> ResolutionContext {
        ResolutionContext::default()
    }

    /// Seeds the secondary cache with user-supplied search roots.
    pub fn with_search_roots(roots: Vec<PathBuf>) -> ResolutionContext {
        ResolutionContext {
            primary: HashSet::new(),
            secondary: roots,
        }
    }

    pub(crate) fn record_hit_dir(&mut self, dir: PathBuf) {
        trace!("caching directory {}", dir.display());
        self.primary.insert(dir);
    }
}

/// Capability for asking a human where a missing file lives.
///
/// Implementations should keep re-prompting (with an error message) while
/// the chosen directory does not contain the missing file, and return `None`
/// when the user declines. The resolvers treat `None` as a cancellation: the
/// frame resolver skips the rest of the group, the calibration resolver
/// suppresses all further prompts for the batch.
pub trait DirectoryPrompt {
    fn request_directory(&self, missing: &Path, start_dir: &Path) -> Option<PathBuf>;
}

/// A prompt that always declines. Used when running unattended.
pub struct NoPrompt;

impl DirectoryPrompt for NoPrompt {
    fn request_directory(&self, _missing: &Path, _start_dir: &Path) -> Option<PathBuf> {
        None
    }
}

/// A directory request in flight from a worker to the controlling thread.
#[derive(Debug)]
pub struct PromptRequest {
    pub missing: PathBuf,
    pub start_dir: PathBuf,
}

/// Channel-backed [DirectoryPrompt] for resolution running on a worker
/// thread. `request_directory` blocks until the controlling thread answers
/// (or drops its end of the channel, which reads as a decline). Cancellation
/// does not interrupt a request already in flight; the controller must still
/// respond or close the channel.
pub struct ChannelPrompt {
    requests: Sender<PromptRequest>,
    responses: Receiver<Option<PathBuf>>,
}

impl ChannelPrompt {
    /// Returns the worker-side prompt plus the controller's end of both
    /// channels.
    pub fn new() -> (ChannelPrompt, Receiver<PromptRequest>, Sender<Option<PathBuf>>) {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
        (
            ChannelPrompt {
                requests: req_tx,
                responses: resp_rx,
            },
            req_rx,
            resp_tx,
        )
    }
}

impl DirectoryPrompt for ChannelPrompt {
    fn request_directory(&self, missing: &Path, start_dir: &Path) -> Option<PathBuf> {
        self.requests
            .send(PromptRequest {
                missing: missing.to_path_buf(),
                start_dir: start_dir.to_path_buf(),
            })
            .ok()?;
        self.responses.recv().ok().flatten()
    }
}

/// Depth-bounded recursive search for `file_name` under `root`. Cancellation
/// is observed before every directory step and short-circuits the walk.
pub(crate) fn find_recursive(
    root: &Path,
    file_name: &str,
    cancel: Option<&AtomicBool>,
) -> Option<PathBuf> {
    find_recursive_inner(root, file_name, cancel, 0)
}

fn find_recursive_inner(
    root: &Path,
    file_name: &str,
    cancel: Option<&AtomicBool>,
    depth: usize,
) -> Option<PathBuf> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
        return None;
    }

    let candidate = root.join(file_name);
    if candidate.is_file() {
        return Some(candidate);
    }

    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(hit) = find_recursive_inner(&path, file_name, cancel, depth + 1) {
                return Some(hit);
            }
        }
    }
    None
}

/// The conventionally-named sibling of a log file's directory (`../name`),
/// if it exists.
pub(crate) fn sibling_dir(log_file: &Path, name: &str) -> Option<PathBuf> {
    let parent = log_file.parent()?.parent()?;
    let candidate = parent.join(name);
    candidate.is_dir().then_some(candidate)
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
