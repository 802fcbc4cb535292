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

//! Transports that move queued messages off this server.
//!
//! The queue workers only see the traits; the shipped implementations hand
//! messages to external commands (a peer-transfer client and a
//! sendmail-compatible local MTA) and map their exit status through the
//! `sysexits` convention: 0 means delivered, `EX_TEMPFAIL` means try again
//! later, anything else means the message cannot be delivered this way.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{error, warn};

use crate::queue::control::ControlFile;
use crate::support::error::Error;
use crate::support::system_config::{PeerConfig, SmtpConfig};
use crate::support::sysexits::EX_TEMPFAIL;

/// Outcome of pushing one message to a peer server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XferOutcome {
    /// Accepted by the peer; the spooled entry can be deleted.
    Done,
    /// Transient failure; keep the entry and retry after a delay.
    Retry,
    /// The peer definitively refused the message.
    Abort,
}

pub trait PeerConn {
    fn send_message(
        &mut self,
        control: &ControlFile,
        data: &Path,
    ) -> Result<XferOutcome, Error>;
}

pub trait PeerTransport: Send + Sync {
    /// Open a connection to `peer`. `Err` is treated like a transient
    /// send failure.
    fn connect(&self, peer: &PeerConfig) -> Result<Box<dyn PeerConn>, Error>;
}

/// How an SMTP hand-off disposed of one recipient.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RecipDisposition {
    Accepted,
    /// Try this recipient again later.
    Transient,
    /// Rejected for good; the sender gets a bounce.
    Permanent(String),
}

pub trait SmtpConn {
    /// Hand the message to the MTA for `recips`, returning a disposition
    /// for each. `Err` means the hand-off as a whole failed and nothing
    /// was accepted.
    fn send_message(
        &mut self,
        sender: &str,
        recips: &[String],
        data: &Path,
    ) -> Result<Vec<(String, RecipDisposition)>, Error>;
}

pub trait SmtpTransport: Send + Sync {
    fn connect(&self) -> Result<Box<dyn SmtpConn>, Error>;
}

/// Peer transport that runs the command configured for the peer, passing
/// the host, control file, and data file as arguments.
pub struct CommandPeerTransport;

struct CommandPeerConn {
    peer: PeerConfig,
}

impl PeerTransport for CommandPeerTransport {
    fn connect(&self, peer: &PeerConfig) -> Result<Box<dyn PeerConn>, Error> {
        if peer.command.is_empty() {
            error!("peer {} has no transfer command configured", peer.name);
            return Err(Error::TransportUnavailable);
        }
        Ok(Box::new(CommandPeerConn { peer: peer.clone() }))
    }
}

impl PeerConn for CommandPeerConn {
    fn send_message(
        &mut self,
        control: &ControlFile,
        data: &Path,
    ) -> Result<XferOutcome, Error> {
        let mut child = Command::new(&self.peer.command[0])
            .args(&self.peer.command[1..])
            .arg(&self.peer.host)
            .arg(data)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                warn!("can't run transfer command for {}: {}", self.peer.name, e);
                Error::TransportUnavailable
            })?;

        // The control file goes on stdin so the command never touches the
        // spool directory.
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(control.encode().as_bytes())?;

        let status = child.wait()?;
        Ok(match status.code() {
            Some(0) => XferOutcome::Done,
            Some(code) if EX_TEMPFAIL.matches(code) => XferOutcome::Retry,
            Some(code) => {
                warn!(
                    "transfer to {} refused, command exited {}",
                    self.peer.name, code
                );
                XferOutcome::Abort
            }
            // Killed by signal; assume the condition is transient.
            None => XferOutcome::Retry,
        })
    }
}

/// SMTP transport that pipes the message to a sendmail-compatible command.
///
/// The MTA accepts or refuses the message as a whole, so every recipient
/// gets the same disposition.
pub struct MtaSmtpTransport {
    config: SmtpConfig,
}

impl MtaSmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        MtaSmtpTransport { config }
    }
}

impl SmtpTransport for MtaSmtpTransport {
    fn connect(&self) -> Result<Box<dyn SmtpConn>, Error> {
        Ok(Box::new(MtaSmtpConn {
            command: self.config.mta_command_or_default(),
        }))
    }
}

struct MtaSmtpConn {
    command: Vec<String>,
}

impl SmtpConn for MtaSmtpConn {
    fn send_message(
        &mut self,
        sender: &str,
        recips: &[String],
        data: &Path,
    ) -> Result<Vec<(String, RecipDisposition)>, Error> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg("-f")
            .arg(sender)
            .arg("--")
            .args(recips)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                warn!("can't run MTA command: {}", e);
                Error::TransportUnavailable
            })?;

        {
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            std::io::copy(&mut std::fs::File::open(data)?, stdin)?;
        }

        let status = child.wait()?;
        let disposition = match status.code() {
            Some(0) => RecipDisposition::Accepted,
            Some(code) if EX_TEMPFAIL.matches(code) => {
                RecipDisposition::Transient
            }
            Some(code) => RecipDisposition::Permanent(format!(
                "mail system returned status {}",
                code
            )),
            None => RecipDisposition::Transient,
        };

        Ok(recips
            .iter()
            .map(|r| (r.clone(), disposition.clone()))
            .collect())
    }
}
