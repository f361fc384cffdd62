//-
// Copyright (c) 2024, The Archiveopteryx Developers
//
// This file is part of Archiveopteryx.
//
// Archiveopteryx is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Archiveopteryx is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
// or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Archiveopteryx. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use log::error;
use structopt::StructOpt;

use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(
    name = "aox",
    about = "The Archiveopteryx mail server",
    author = "The Archiveopteryx Developers",
)]
enum Command {
    /// Run the IMAP, LMTP, and submission services and the delivery
    /// queue.
    Serve {
        #[structopt(
            long,
            short,
            default_value = "/etc/archiveopteryx/archiveopteryx.toml"
        )]
        config: PathBuf,
    },

    /// Delete a user.
    ///
    /// Refuses to delete a user whose mailboxes still hold messages
    /// unless -f is given.
    DeleteUser {
        login: String,
        #[structopt(short = "f")]
        force: bool,
        #[structopt(
            long,
            short,
            default_value = "/etc/archiveopteryx/archiveopteryx.toml"
        )]
        config: PathBuf,
    },
}

pub fn main() {
    let command = Command::from_args();
    crate::init_simple_log();

    let result = match command {
        Command::Serve { config } => {
            load_config(&config).and_then(super::serve::serve)
        },
        Command::DeleteUser {
            login,
            force,
            config,
        } => load_config(&config)
            .and_then(|config| super::user::delete_user(config, &login, force)),
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("aox: {e}");
        std::process::exit(1);
    }
}

fn load_config(
    path: &std::path::Path,
) -> Result<SystemConfig, crate::support::error::Error> {
    let text = std::fs::read_to_string(path)?;
    SystemConfig::load(&text)
}
