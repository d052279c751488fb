// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code.
//!
//! Only 3 things should be public in this module: `Stacklog`,
//! `Stacklog::run`, and the re-exported `StacklogError`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{AppSettings, Args, Parser, Subcommand};
use itertools::Itertools;
use log::{debug, info, trace, warn};

pub use crate::error::StacklogError;
use crate::group::AcquisitionGroup;
use crate::logparse::light::{can_parse, parse_light_blocks};
use crate::resolve::{
    find_recursive, resolve_calibration, resolve_frames, ChannelPrompt, DirectoryPrompt, NoPrompt,
    ResolutionContext,
};
use crate::xisf::{read_frame_count, read_frame_header};

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "Session reporting for stacked astrophotography data: parses \
             stacking logs into acquisition groups and resolves each group's \
             frames and calibration masters on disk."
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Stacklog {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Parse stacking logs and resolve every group's frames and \
                    calibration masters.")]
    Scan(ScanArgs),

    #[clap(about = "Print the integrated-frame count of a single master file.")]
    FrameCount {
        #[clap(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },

    #[clap(about = "Print the acquisition keywords of a single frame file.")]
    Header {
        #[clap(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Paths to the stacking log file(s) to parse.
    #[clap(name = "LOG_FILE", parse(from_os_str), required = true)]
    logs: Vec<PathBuf>,

    /// Additional directories to search (recursively, to a fixed depth) for
    /// files that have moved since the logs were written.
    #[clap(short, long, multiple_values(true))]
    search_dir: Vec<PathBuf>,

    /// Keyword names whose value names the target (e.g. TARGET). When none
    /// are given, targets come only from frame headers.
    #[clap(short, long, multiple_values(true))]
    target_keyword: Vec<String>,

    /// Never ask for directories interactively; unlocatable files are simply
    /// reported as unresolved.
    #[clap(long)]
    no_prompt: bool,
}

impl Stacklog {
    pub fn run(self) -> Result<(), StacklogError> {
        setup_logging(self.global_opts.verbosity);

        let sub_command = match &self.command {
            Command::Scan(_) => "scan",
            Command::FrameCount { .. } => "frame-count",
            Command::Header { .. } => "header",
        };
        info!("stacklog {} {}", sub_command, env!("CARGO_PKG_VERSION"));

        match self.command {
            Command::Scan(args) => scan(args)?,

            Command::FrameCount { file } => match read_frame_count(&file) {
                Some(n) => info!("{}: {} integrated frames", file.display(), n),
                None => info!("{}: no frame count found", file.display()),
            },

            Command::Header { file } => match read_frame_header(&file) {
                Some(h) => {
                    info!("{}:", file.display());
                    info!("  session date : {}", opt(h.date));
                    info!("  gain         : {}", opt(h.gain));
                    info!("  sensor temp  : {}", opt(h.sensor_temp));
                    info!("  ambient temp : {}", opt(h.ambient_temp));
                    info!("  filter       : {}", h.filter.as_deref().unwrap_or("-"));
                    info!("  object       : {}", h.object.as_deref().unwrap_or("-"));
                }
                None => info!("{}: no readable header", file.display()),
            },
        }

        info!("stacklog {} complete.", sub_command);
        Ok(())
    }
}

fn scan(args: ScanArgs) -> Result<(), StacklogError> {
    let mut groups: Vec<AcquisitionGroup> = Vec::new();
    for log in &args.logs {
        if !can_parse(log) {
            warn!(
                "{}: no producer markers found; attempting to parse anyway",
                log.display()
            );
        }
        match parse_light_blocks(log, &args.target_keyword) {
            Ok(gs) => groups.extend(gs),
            Err(e) => warn!("{e}"),
        }
    }
    if groups.is_empty() {
        return Err(StacklogError::NoGroups);
    }
    let total: usize = groups.iter().map(|g| g.frame_count()).sum();
    info!("{} group(s), {total} frame(s) to resolve", groups.len());

    let mut ctx = ResolutionContext::with_search_roots(args.search_dir.clone());
    let cancel = Arc::new(AtomicBool::new(false));

    if args.no_prompt {
        resolve_frames(&mut groups, &mut ctx, &NoPrompt, &cancel, |done| {
            trace!("resolved {done}/{total}")
        });
        resolve_calibration(&mut groups, &args.logs, &mut ctx, &NoPrompt);
    } else {
        // Header reading runs on a worker so the controlling thread stays
        // free to answer its directory requests.
        let (prompt, req_rx, resp_tx) = ChannelPrompt::new();
        let worker_cancel = Arc::clone(&cancel);
        let worker = std::thread::spawn(move || {
            resolve_frames(&mut groups, &mut ctx, &prompt, &worker_cancel, |done| {
                trace!("resolved {done}/{total}")
            });
            (groups, ctx)
        });
        for req in req_rx.iter() {
            let answer = ask_directory(&req.missing, &req.start_dir)?;
            if resp_tx.send(answer).is_err() {
                break;
            }
        }
        let (resolved, kept_ctx) = worker.join().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "frame resolution worker panicked")
        })?;
        groups = resolved;
        ctx = kept_ctx;

        resolve_calibration(&mut groups, &args.logs, &mut ctx, &StdinPrompt);
    }

    for g in &groups {
        let resolved = g.frames.iter().filter(|f| f.resolved).count();
        info!("{}", "-".repeat(60));
        info!("{} [{}]", g.label(), g.filter);
        info!(
            "  {} x {}s, binning {}, {resolved}/{} frame(s) resolved",
            g.frame_count(),
            g.exposure_sec,
            g.binning,
            g.frame_count()
        );
        let dates = g.frames.iter().filter_map(|f| f.date).unique().sorted();
        info!("  session date(s) : {}", dates.map(|d| d.to_string()).join(", "));
        info!(
            "  calibration     : darks {} / flats {} / bias {}",
            opt(g.darks),
            opt(g.flats),
            opt(g.bias)
        );
    }

    Ok(())
}

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Asks on stdin for the directory containing `missing`, re-asking while the
/// chosen directory does not contain it. An empty answer declines.
fn ask_directory(missing: &Path, start_dir: &Path) -> Result<Option<PathBuf>, StacklogError> {
    let fname = missing
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut line = String::new();
    loop {
        println!("Cannot find {fname} (last seen near {})", start_dir.display());
        print!("Directory to search, or blank to skip: ");
        std::io::stdout().flush()?;
        line.clear();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let answer = line.trim();
        if answer.is_empty() {
            return Ok(None);
        }
        let dir = PathBuf::from(answer);
        if find_recursive(&dir, &fname, None).is_some() {
            debug!("searching {} for further files", dir.display());
            return Ok(Some(dir));
        }
        println!("{fname} was not found under {}", dir.display());
    }
}

/// Synchronous stdin-backed prompt for resolution running on the controlling
/// thread. I/O failures read as a decline.
struct StdinPrompt;

impl DirectoryPrompt for StdinPrompt {
    fn request_directory(&self, missing: &Path, start_dir: &Path) -> Option<PathBuf> {
        ask_directory(missing, start_dir).ok().flatten()
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g. a
/// terminal); piped output will be formatted sensibly. Source code lines are
/// displayed in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}
