// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The main stacklog binary.

use clap::Parser;

use stacklog::Stacklog;

fn main() {
    // Stacklog's run() handles all the subcommands; main() only turns its
    // error into an exit code.
    match Stacklog::parse().run() {
        Ok(()) => (),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
