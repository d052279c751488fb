// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Session reporting for stacked astrophotography data.

Stacking logs are parsed into acquisition groups (one per light-integration
block), the registered frames of each group are located on disk and their
acquisition keywords read, and each group's master dark/flat/bias are
resolved to integrated-frame counts.
 */

pub mod cli;
mod error;
pub mod group;
pub mod logparse;
pub mod resolve;
pub mod xisf;

// Re-exports.
pub use cli::Stacklog;
pub use error::StacklogError;
pub use group::{AcquisitionGroup, TargetSource};
pub use resolve::{
    ChannelPrompt, DirectoryPrompt, NoPrompt, PromptRequest, ResolutionContext,
};
pub use xisf::{read_frame_count, read_frame_header, FrameHeader};
