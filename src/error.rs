// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all stacklog-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StacklogError {
    #[error("No integration blocks found in any of the supplied logs")]
    NoGroups,

    #[error("{0}")]
    LogParse(#[from] crate::logparse::LogParseError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
