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

//! The delivery engine proper.
//!
//! `Delivery::deliver` is the one entry point for submitting a message:
//! it assigns the message id, renders the header variants implied by the
//! bcc structure, partitions the recipients across destinations, files the
//! sender's audit copy, and bounces anything that could not be delivered.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::{error, warn};

use crate::dnd::{Directory, Lookup};
use crate::mbox::cache::MboxCache;
use crate::mbox::model::{
    MessageId, Recip, RecipAddr, RecipStatus, Summary, SummaryFlags,
    FOLDER_AUDIT, FOLDER_INBOX,
};
use crate::notify::Notifier;
use crate::queue::control::{ControlFile, ControlRecips};
use crate::queue::manager::{Dest, QueueManager};
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::system_config::SystemConfig;
use crate::xfer::{RecipDisposition, SmtpTransport};

/// Message ids are reserved from the durable ceiling in blocks, so a crash
/// skips at most this many ids and never reuses one.
const MID_BLOCK: u64 = 100;

/// File under the spool root holding the message id ceiling.
const MID_FILE: &str = "message-id";

pub(super) struct MessageIdSource {
    path: PathBuf,
    tmp: PathBuf,
    /// (next id to hand out, durable ceiling)
    state: Mutex<(u64, u64)>,
}

impl MessageIdSource {
    fn open(path: PathBuf, tmp: PathBuf) -> Result<Self, Error> {
        let stored = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u64>().map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt message id file {}", path.display()),
                ))
            })?,
            Err(ref e) if io::ErrorKind::NotFound == e.kind() => 1,
            Err(e) => return Err(e.into()),
        };

        Ok(MessageIdSource {
            path,
            tmp,
            state: Mutex::new((stored, stored)),
        })
    }

    pub(super) fn next(&self) -> Result<MessageId, Error> {
        let mut state = self.state.lock().unwrap();
        if state.0 >= state.1 {
            let ceiling = state.0 + MID_BLOCK;
            file_ops::spit(
                &self.tmp,
                &self.path,
                true,
                ceiling.to_string().as_bytes(),
            )?;
            state.1 = ceiling;
        }
        let mid = MessageId(state.0);
        state.0 += 1;
        Ok(mid)
    }
}

/// A message submitted for delivery.
pub struct DeliverReq {
    /// Display name shown in the header.
    pub sender_name: String,
    /// Where failure notices go: a local user name or an Internet address.
    pub sender_addr: String,
    /// The local sender's uid, for the audit copy. `None` for mail
    /// originating off-host.
    pub sender_uid: Option<crate::mbox::model::Uid>,
    pub to: Vec<Recip>,
    pub cc: Vec<Recip>,
    pub bcc: Vec<Recip>,
    pub subject: String,
    pub body: Vec<u8>,
    pub flags: SummaryFlags,
    /// Replace the visible recipient list with a placeholder.
    pub hide_recipients: bool,
    /// System-generated mail (bounces, vacation replies). Gets no audit
    /// copy and never triggers a further bounce.
    pub system: bool,
}

impl DeliverReq {
    pub fn new(
        sender_name: impl Into<String>,
        sender_addr: impl Into<String>,
    ) -> Self {
        DeliverReq {
            sender_name: sender_name.into(),
            sender_addr: sender_addr.into(),
            sender_uid: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body: Vec::new(),
            flags: SummaryFlags::UNREAD,
            hide_recipients: false,
            system: false,
        }
    }

    fn all_recips(&self) -> impl Iterator<Item = &Recip> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

pub struct Delivery {
    pub(super) config: Arc<SystemConfig>,
    pub(super) cache: Arc<MboxCache>,
    pub(super) queues: Arc<QueueManager>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) smtp: Arc<dyn SmtpTransport>,
    mids: MessageIdSource,
}

impl Delivery {
    pub fn new(
        config: Arc<SystemConfig>,
        cache: Arc<MboxCache>,
        queues: Arc<QueueManager>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        smtp: Arc<dyn SmtpTransport>,
    ) -> Result<Arc<Self>, Error> {
        let mids = MessageIdSource::open(
            queues.spool().root().join(MID_FILE),
            queues.spool().tmp_dir(),
        )?;
        Ok(Arc::new(Delivery {
            config,
            cache,
            queues,
            directory,
            notifier,
            smtp,
            mids,
        }))
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Resolve one recipient name through the directory.
    ///
    /// Names containing `@` are Internet addresses and bypass the
    /// directory entirely. Resolution failure is recorded in the returned
    /// recipient's status, never as an `Err`.
    pub fn resolve_one(&self, name: &str) -> Recip {
        if name.contains('@') {
            return Recip::internet(name);
        }

        match self.directory.resolve(name) {
            Ok(Lookup::Hosted {
                uid,
                server,
                filesystem,
            }) => Recip::hosted(name, uid, server, filesystem),
            Ok(Lookup::Ambiguous) => {
                failed_recip(name, RecipStatus::Ambiguous)
            }
            Ok(Lookup::NoSuchUser) => {
                failed_recip(name, RecipStatus::BadAddress)
            }
            Ok(Lookup::NoSendPermission) => {
                failed_recip(name, RecipStatus::NoSendPermission)
            }
            Err(e) => {
                warn!("directory lookup for {:?} failed: {}", name, e);
                failed_recip(name, RecipStatus::DirectoryUnavailable)
            }
        }
    }

    /// Resolve a list of names, expanding the sender's private mailing
    /// lists one level. Members introduced by one list expansion share a
    /// bcc-visibility group.
    pub fn resolve_recipients(
        &self,
        sender_uid: Option<crate::mbox::model::Uid>,
        names: &[String],
    ) -> Vec<Recip> {
        let mut out = Vec::new();
        let mut next_group = 1u32;

        for name in names {
            if let Some(members) = self.private_list(sender_uid, name) {
                let group = next_group;
                next_group += 1;
                for member in members {
                    let mut r = self.resolve_one(&member);
                    r.group = group;
                    out.push(r);
                }
            } else {
                out.push(self.resolve_one(name));
            }
        }

        out
    }

    fn private_list(
        &self,
        sender_uid: Option<crate::mbox::model::Uid>,
        name: &str,
    ) -> Option<Vec<String>> {
        let uid = sender_uid?;
        let r = self.cache.find(uid, None, true).ok()?;
        let members = r.lock().mailing_list(name).ok()??;
        Some(members)
    }

    /// Deliver a message to every recipient of `req`, returning its
    /// message id.
    ///
    /// Delivery as a whole only fails for infrastructure reasons (no
    /// message id could be assigned, the spool is unwritable). Individual
    /// recipient failures turn into a bounce to the sender instead.
    pub fn deliver(&self, req: &DeliverReq) -> Result<MessageId, Error> {
        let mid = self.mids.next()?;
        let date = Utc::now();

        let mut failures: Vec<(String, String)> = req
            .all_recips()
            .filter(|r| !r.status.is_ok())
            .map(|r| (r.name.clone(), r.status.reason().to_owned()))
            .collect();

        // One rendered copy for the visible recipients, plus one per bcc
        // group so no bcc recipient learns of any other group.
        let mut variants: Vec<(String, Vec<&Recip>)> = Vec::new();
        let visible: Vec<&Recip> =
            req.to.iter().chain(&req.cc).filter(ok).collect();
        if !visible.is_empty() {
            variants.push((self.render_header(req, mid, date, None), visible));
        }
        let mut groups: Vec<u32> = req
            .bcc
            .iter()
            .filter(|r| r.status.is_ok())
            .map(|r| r.group)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            let members: Vec<&Recip> = req
                .bcc
                .iter()
                .filter(|r| r.status.is_ok() && r.group == group)
                .collect();
            variants.push((
                self.render_header(req, mid, date, Some(&members)),
                members,
            ));
        }

        let main_header = variants
            .first()
            .map(|(h, _)| h.clone())
            .unwrap_or_else(|| self.render_header(req, mid, date, None));

        for (header, recips) in &variants {
            let mut message =
                Vec::with_capacity(header.len() + 2 + req.body.len());
            message.extend_from_slice(header.as_bytes());
            message.extend_from_slice(b"\r\n");
            message.extend_from_slice(&req.body);

            let summary = Summary {
                message_id: mid,
                date,
                size: message.len() as u64,
                flags: req.flags,
                sender: req.sender_name.clone(),
                subject: req.subject.clone(),
            };

            let (hosted, internet): (Vec<&Recip>, Vec<&Recip>) =
                recips.iter().partition(|r| r.uid().is_some());

            if !hosted.is_empty() {
                failures.extend(partition_failures(
                    self,
                    &hosted,
                    &req.sender_addr,
                    &summary,
                    &message,
                ));
            }
            if !internet.is_empty() {
                let addrs: Vec<String> = internet
                    .iter()
                    .map(|r| match r.addr {
                        RecipAddr::Internet { ref address } => {
                            address.clone()
                        }
                        RecipAddr::Hosted { .. } => unreachable!(),
                    })
                    .collect();
                failures.extend(self.internet_deliver(
                    &req.sender_addr,
                    addrs,
                    &summary,
                    &message,
                ));
            }
        }

        if !req.system {
            self.file_audit_copy(req, mid, date);

            if !failures.is_empty() {
                super::bounce::send_bounce(
                    self,
                    &req.sender_addr,
                    &failures,
                    main_header.as_bytes(),
                );
            }
        } else if !failures.is_empty() {
            warn!(
                "system message {} undeliverable to {} recipient(s)",
                mid,
                failures.len()
            );
        }

        Ok(mid)
    }

    /// Deliver one already-resolved recipient of an existing message.
    /// Used by forwarding and by queue workers after re-resolution.
    pub(crate) fn redispatch(
        &self,
        sender_addr: &str,
        recip: &Recip,
        summary: &Summary,
        message: &[u8],
    ) -> Vec<(String, String)> {
        match recip.addr {
            RecipAddr::Hosted { .. } => partition_failures(
                self,
                &[recip],
                sender_addr,
                summary,
                message,
            ),
            RecipAddr::Internet { ref address } => self.internet_deliver(
                sender_addr,
                vec![address.clone()],
                summary,
                message,
            ),
        }
    }

    /// Spool one complete entry under `dest` and hand it to the worker.
    ///
    /// The control file is durable before the data file appears; a crash
    /// between the two steps leaves a control-only stray which recovery
    /// quarantines.
    pub(crate) fn spool_to(
        &self,
        dest: Dest,
        control: &ControlFile,
        message: &[u8],
    ) -> Result<u64, Error> {
        let qm = &self.queues;
        let spool = qm.spool();
        let qid = qm.next_qid();
        let dest_name = qm.dest_name(dest).to_owned();

        let canonical = spool.tmp_dir().join(format!("q{}", qid));
        file_ops::spit(&spool.tmp_dir(), &canonical, true, message)?;

        spool.commit_control(&dest_name, qid, control)?;
        spool.link_data(&dest_name, qid, &canonical)?;
        fs::remove_file(&canonical).ignore_not_found()?;

        qm.enqueue(dest, qid);
        Ok(qid)
    }

    fn internet_deliver(
        &self,
        sender_addr: &str,
        addrs: Vec<String>,
        summary: &Summary,
        message: &[u8],
    ) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        let mut to_spool = addrs;

        if self.config.smtp.use_local_mta {
            to_spool = match self.hand_to_mta(sender_addr, &to_spool, message)
            {
                Ok((spoolable, mut perm)) => {
                    failures.append(&mut perm);
                    spoolable
                }
                Err(e) => {
                    warn!("MTA hand-off failed, spooling instead: {}", e);
                    to_spool
                }
            };
        }

        if to_spool.is_empty() {
            return failures;
        }

        let control = ControlFile {
            sender: sender_addr.to_owned(),
            summary: summary.clone(),
            recips: ControlRecips::Smtp(to_spool.clone()),
        };
        if let Err(e) = self.spool_to(Dest::Internet, &control, message) {
            error!("can't spool Internet mail: {}", e);
            failures.extend(to_spool.into_iter().map(|a| {
                (a, "the outgoing mail spool is unavailable".to_owned())
            }));
        }

        failures
    }

    /// Returns (recipients to spool for retry, permanent failures).
    fn hand_to_mta(
        &self,
        sender_addr: &str,
        addrs: &[String],
        message: &[u8],
    ) -> Result<(Vec<String>, Vec<(String, String)>), Error> {
        let spool_tmp = self.queues.spool().tmp_dir();
        let staged = spool_tmp.join(format!("mta{}", std::process::id()));
        file_ops::spit(&spool_tmp, &staged, true, message)?;

        let mut conn = self.smtp.connect()?;
        let result = conn.send_message(sender_addr, addrs, &staged);
        fs::remove_file(&staged).ignore_not_found()?;

        let mut spoolable = Vec::new();
        let mut perm = Vec::new();
        for (addr, disposition) in result? {
            match disposition {
                RecipDisposition::Accepted => (),
                RecipDisposition::Transient => spoolable.push(addr),
                RecipDisposition::Permanent(reason) => {
                    perm.push((addr, reason))
                }
            }
        }
        Ok((spoolable, perm))
    }

    /// File the sender's copy in their Audit folder.
    ///
    /// The audit copy normally shares the message id, but if the sender is
    /// also a recipient their Inbox already holds that id, and the audit
    /// copy takes a fresh one so the two copies stay distinct.
    fn file_audit_copy(
        &self,
        req: &DeliverReq,
        mid: MessageId,
        date: DateTime<Utc>,
    ) {
        let sender_uid = match req.sender_uid {
            Some(uid) => uid,
            None => return,
        };

        let header = self.render_audit_header(req, mid, date);
        let mut message =
            Vec::with_capacity(header.len() + 2 + req.body.len());
        message.extend_from_slice(header.as_bytes());
        message.extend_from_slice(b"\r\n");
        message.extend_from_slice(&req.body);

        let result = (|| -> Result<(), Error> {
            let r = self.cache.find(sender_uid, None, false)?;
            let mut state = r.lock();

            let audit_mid =
                if state.contains_message(FOLDER_INBOX, mid).unwrap_or(false)
                {
                    self.mids.next()?
                } else {
                    mid
                };

            let summary = Summary {
                message_id: audit_mid,
                date,
                size: message.len() as u64,
                // the sender has read their own message
                flags: req.flags - SummaryFlags::UNREAD,
                sender: req.sender_name.clone(),
                subject: req.subject.clone(),
            };

            match state.append_message(FOLDER_AUDIT, summary, &message) {
                Ok(()) | Err(Error::DuplicateMessage) => Ok(()),
                Err(e) => Err(e),
            }
        })();

        if let Err(e) = result {
            warn!("can't file audit copy for uid {}: {}", sender_uid, e);
        }
    }

    fn render_header(
        &self,
        req: &DeliverReq,
        mid: MessageId,
        date: DateTime<Utc>,
        bcc_group: Option<&[&Recip]>,
    ) -> String {
        let mut header = String::new();
        header.push_str(&format!(
            "Received: by {} (Packmule); {}\r\n",
            self.config.server.name,
            date.to_rfc2822()
        ));
        header.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        header.push_str(&format!(
            "From: {}\r\n",
            from_field(&req.sender_name, &req.sender_addr)
        ));

        if req.hide_recipients {
            header.push_str("To: (recipients withheld)\r\n");
        } else {
            push_recip_line(&mut header, "To", &req.to);
            push_recip_line(&mut header, "Cc", &req.cc);
        }
        if let Some(members) = bcc_group {
            let names: Vec<&str> = members
                .iter()
                .filter(|r| !r.flags.contains(
                    crate::mbox::model::RecipFlags::NOSHOW,
                ))
                .map(|r| r.name.as_str())
                .collect();
            if !names.is_empty() {
                header.push_str(&format!("Bcc: {}\r\n", names.join(", ")));
            }
        }

        header.push_str(&format!(
            "Message-ID: <{}@{}>\r\n",
            mid, self.config.server.name
        ));
        header.push_str(&format!("Subject: {}\r\n", req.subject));
        header
    }

    /// The audit copy shows the sender everything, bcc included.
    fn render_audit_header(
        &self,
        req: &DeliverReq,
        mid: MessageId,
        date: DateTime<Utc>,
    ) -> String {
        let mut header = String::new();
        header.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        header.push_str(&format!(
            "From: {}\r\n",
            from_field(&req.sender_name, &req.sender_addr)
        ));
        push_recip_line(&mut header, "To", &req.to);
        push_recip_line(&mut header, "Cc", &req.cc);
        push_recip_line(&mut header, "Bcc", &req.bcc);
        header.push_str(&format!(
            "Message-ID: <{}@{}>\r\n",
            mid, self.config.server.name
        ));
        header.push_str(&format!("Subject: {}\r\n", req.subject));
        header
    }
}

fn ok(r: &&Recip) -> bool {
    r.status.is_ok()
}

fn failed_recip(name: &str, status: RecipStatus) -> Recip {
    let mut r = Recip::internet(name);
    r.status = status;
    r
}

fn from_field(name: &str, addr: &str) -> String {
    if name == addr {
        name.to_owned()
    } else {
        format!("{} <{}>", name, addr)
    }
}

fn push_recip_line(header: &mut String, field: &str, recips: &[Recip]) {
    let names: Vec<&str> = recips
        .iter()
        .filter(|r| {
            !r.flags
                .contains(crate::mbox::model::RecipFlags::NOSHOW)
        })
        .map(|r| r.name.as_str())
        .collect();
    if !names.is_empty() {
        header.push_str(&format!("{}: {}\r\n", field, names.join(", ")));
    }
}

fn partition_failures(
    delivery: &Delivery,
    recips: &[&Recip],
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
) -> Vec<(String, String)> {
    super::partition::dispatch_hosted(
        delivery,
        recips,
        sender_addr,
        summary,
        message,
    )
}

/// The message header, up to but not including the blank separator line.
pub fn header_of(message: &[u8]) -> String {
    let end = message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(message.len());
    String::from_utf8_lossy(&message[..end]).into_owned()
}

/// Number of transport hops the message has taken so far.
pub fn count_hops(message: &[u8]) -> usize {
    header_of(message)
        .lines()
        .filter(|l| {
            l.as_bytes().len() >= 9
                && l.as_bytes()[..9].eq_ignore_ascii_case(b"received:")
        })
        .count()
}

/// Record one more transport hop at the top of the header.
pub fn add_hop(server: &str, message: &[u8]) -> Vec<u8> {
    let line = format!(
        "Received: by {} (Packmule); {}\r\n",
        server,
        Utc::now().to_rfc2822()
    );
    let mut out = Vec::with_capacity(line.len() + message.len());
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(message);
    out
}
