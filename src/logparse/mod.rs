// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scanners for stacking-session log files.
//!
//! The logs are large, loosely structured text files in which the sections
//! of interest are delimited by `* Begin …` / `* End …` marker lines. Each
//! scanner walks the file once with the markers as synchronisation points.
//! Lines may carry a leading `[YYYY-MM-DD HH:MM:SS] ` timestamp which is
//! stripped before any pattern matching.

pub mod calibration;
pub mod light;

pub use calibration::{CalibrationBlock, FlatBlock};

use std::borrow::Cow;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogParseError {
    #[error("Cannot open log file {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
}

lazy_static! {
    static ref RE_TIMESTAMP: Regex =
        Regex::new(r"\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] ").unwrap();
}

/// Removes bracketed timestamp tokens from a log line. Timestamps are
/// irrelevant to content matching and would break fixed patterns.
pub(crate) fn strip_timestamp(line: &str) -> Cow<'_, str> {
    RE_TIMESTAMP.replace_all(line, "")
}

/// Slurps a log file into lines. The logs are nominally UTF-8 but older
/// producers emitted Latin-1; invalid sequences are replaced rather than
/// rejected.
pub(crate) fn read_log_lines(path: &Path) -> Result<Vec<String>, LogParseError> {
    let bytes = std::fs::read(path).map_err(|err| LogParseError::Io {
        path: path.display().to_string(),
        err,
    })?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(|l| l.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_stripped() {
        assert_eq!(
            strip_timestamp("[2024-03-15 22:01:09] * Begin integration of Light frames"),
            "* Begin integration of Light frames"
        );
    }

    #[test]
    fn untimestamped_lines_pass_through() {
        assert_eq!(strip_timestamp("Filter : Ha"), "Filter : Ha");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read_log_lines(Path::new("/no/such/file.log")).unwrap_err();
        assert!(matches!(err, LogParseError::Io { .. }));
    }
}
