//-
// Copyright (c) 2026, the Packmule authors
//
// This file is part of Packmule.
//
// Packmule is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Packmule is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Packmule. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe folder, peer, or user name")]
    UnsafeName,
    #[error("Mailbox is no longer hosted on this server")]
    MailboxGone,
    #[error("No such folder")]
    NxFolder,
    #[error("Folder already exists")]
    FolderExists,
    #[error("Message already present in folder")]
    DuplicateMessage,
    #[error("Message data not found")]
    NxMessage,
    #[error("Malformed control file")]
    BadControlFile,
    #[error("No local filesystem is usable for mailbox storage")]
    NoFilesystemAvailable,
    #[error("Directory service unavailable")]
    DirectoryUnavailable,
    #[error("Too many forwarding hops")]
    ForwardingLoop,
    #[error("Transport unavailable")]
    TransportUnavailable,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
