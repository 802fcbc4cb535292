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

//! The control-file format.
//!
//! Each spooled message is described by a text sidecar of CRLF-terminated
//! lines: line 1 the bounce/sender address, line 2 the packed summary
//! record, then one line per recipient. Peer-queue (and local-queue) files
//! carry `uid,filesystem,timestamp,name,flags` recipient lines; SMTP-queue
//! files carry bare addresses.

use std::fs;
use std::io;
use std::path::Path;

use chrono::prelude::*;

use crate::mbox::model::{
    escape_field, unescape_field, MessageId, RecipFlags, Summary, Uid,
};
use crate::support::error::Error;
use crate::support::file_ops;

/// Which recipient-line variant a control file uses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlKind {
    Peer,
    Smtp,
}

/// One recipient of a peer-queue control file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecip {
    pub uid: Uid,
    /// Disk volume on the destination server, empty if not yet assigned.
    pub filesystem: String,
    /// When the routing information was resolved; stale entries are
    /// re-resolved before local delivery.
    pub resolved_at: DateTime<Utc>,
    pub name: String,
    pub flags: RecipFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRecips {
    Peer(Vec<PeerRecip>),
    Smtp(Vec<String>),
}

impl ControlRecips {
    pub fn len(&self) -> usize {
        match *self {
            ControlRecips::Peer(ref v) => v.len(),
            ControlRecips::Smtp(ref v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlFile {
    /// Where failure notices for this message go.
    pub sender: String,
    pub summary: Summary,
    pub recips: ControlRecips,
}

impl ControlFile {
    pub fn message_id(&self) -> MessageId {
        self.summary.message_id
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&escape_field(&self.sender));
        out.push_str("\r\n");
        out.push_str(&self.summary.encode());
        out.push_str("\r\n");

        match self.recips {
            ControlRecips::Peer(ref recips) => {
                for r in recips {
                    out.push_str(&format!(
                        "{},{},{},{},{}\r\n",
                        r.uid,
                        escape_field(&r.filesystem),
                        r.resolved_at.timestamp(),
                        escape_field(&r.name),
                        r.flags.bits(),
                    ));
                }
            }
            ControlRecips::Smtp(ref addrs) => {
                for a in addrs {
                    out.push_str(&escape_field(a));
                    out.push_str("\r\n");
                }
            }
        }

        out
    }

    pub fn decode(text: &str, kind: ControlKind) -> Result<Self, Error> {
        let mut lines = text.lines();
        let sender =
            unescape_field(lines.next().ok_or(Error::BadControlFile)?);
        let summary =
            Summary::decode(lines.next().ok_or(Error::BadControlFile)?)?;

        let recips = match kind {
            ControlKind::Peer => ControlRecips::Peer(
                lines
                    .filter(|l| !l.is_empty())
                    .map(decode_peer_recip)
                    .collect::<Result<_, _>>()?,
            ),
            ControlKind::Smtp => ControlRecips::Smtp(
                lines
                    .filter(|l| !l.is_empty())
                    .map(unescape_field)
                    .collect(),
            ),
        };

        if recips.is_empty() {
            return Err(Error::BadControlFile);
        }

        Ok(ControlFile {
            sender,
            summary,
            recips,
        })
    }

    pub fn read(path: &Path, kind: ControlKind) -> Result<Self, Error> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
                return Err(Error::NxMessage)
            }
            Err(e) => return Err(e.into()),
        };
        Self::decode(&text, kind)
    }

    /// Atomically (re)write this control file.
    ///
    /// `tmp` must be on the same filesystem as `path`; the file is fully
    /// written and durable before it appears under its final name.
    pub fn write(
        &self,
        tmp: &Path,
        path: &Path,
        overwrite: bool,
    ) -> Result<(), Error> {
        file_ops::spit(tmp, path, overwrite, self.encode().as_bytes())?;
        Ok(())
    }
}

fn decode_peer_recip(line: &str) -> Result<PeerRecip, Error> {
    let fields: Vec<&str> = line.split(',').collect();
    if 5 != fields.len() {
        return Err(Error::BadControlFile);
    }

    let uid = Uid(fields[0].parse().map_err(|_| Error::BadControlFile)?);
    let stamp: i64 = fields[2].parse().map_err(|_| Error::BadControlFile)?;
    let bits: u32 = fields[4].parse().map_err(|_| Error::BadControlFile)?;

    Ok(PeerRecip {
        uid,
        filesystem: unescape_field(fields[1]),
        resolved_at: Utc
            .timestamp_opt(stamp, 0)
            .single()
            .ok_or(Error::BadControlFile)?,
        name: unescape_field(fields[3]),
        flags: RecipFlags::from_bits_truncate(bits),
    })
}
