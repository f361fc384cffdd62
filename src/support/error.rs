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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database worker is gone")]
    DatabaseUnavailable,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Transaction already completed")]
    TransactionCompleted,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Non-existent message")]
    NxMessage,
    #[error("No such user")]
    NxUser,
    #[error("Mailbox is not empty")]
    MailboxNotEmpty,
    #[error("Connection closed by peer")]
    ClosedByPeer,
    #[error("Bad listen address: {0}")]
    BadListenAddress(String),
    #[error("Spool manager has been shut down")]
    SpoolShutDown,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
