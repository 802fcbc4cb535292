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

//! The per-destination worker loops.
//!
//! Each loop repeats one step: look at the head entry of its queue,
//! process it, and either dispose of it (success or permanent failure) or
//! sleep out a doubling retry delay with the entry still at the head. A
//! crash mid-step is harmless; redelivery of an already-delivered message
//! is suppressed by the message id check in the mailbox.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};

use crate::deliver::engine::{count_hops, header_of};
use crate::deliver::local::{self, LocalOutcome, LocalTarget};
use crate::deliver::{bounce, Delivery};
use crate::dnd::Lookup;
use crate::mbox::model::{Recip, RecipStatus};
use crate::queue::control::{ControlFile, ControlKind, ControlRecips};
use crate::queue::manager::{Dest, QueueManager};
use crate::support::error::Error;
use crate::support::system_config::{PeerConfig, QueueTuning};
use crate::xfer::{PeerConn, PeerTransport, SmtpConn, SmtpTransport, XferOutcome};

/// Doubling retry delay with a ceiling, reset after any success.
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Backoff {
            initial,
            ceiling,
            next: initial,
        }
    }

    pub fn from_tuning(tuning: &QueueTuning) -> Self {
        Self::new(
            Duration::from_secs(tuning.retry_initial_secs),
            Duration::from_secs(tuning.retry_ceiling_secs),
        )
    }

    pub fn delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// What a worker step decided about the head entry.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Processed; remove the entry.
    Done,
    /// Transient failure; keep the entry at the head and retry later.
    Retry,
    /// The entry cannot be processed and has been disposed of (bounced or
    /// quarantined); remove what remains of it.
    Abort,
}

fn settle(
    qm: &QueueManager,
    dest: Dest,
    qid: u64,
    outcome: StepOutcome,
    backoff: &mut Backoff,
) {
    match outcome {
        StepOutcome::Done | StepOutcome::Abort => {
            if let Err(e) = qm.spool().remove(qm.dest_name(dest), qid) {
                warn!(
                    "can't remove spool entry {}/{}: {}",
                    qm.dest_name(dest),
                    qid,
                    e
                );
            }
            qm.pop_head(dest, qid);
            // Only a full success vouches for the destination being
            // reachable again.
            if StepOutcome::Done == outcome {
                backoff.reset();
            }
        }
        StepOutcome::Retry => {
            let delay = backoff.delay();
            info!(
                "{}: retrying entry {} in {:?}",
                qm.dest_name(dest),
                qid,
                delay
            );
            std::thread::sleep(delay);
        }
    }
}

fn read_control(
    qm: &QueueManager,
    dest: Dest,
    qid: u64,
    kind: ControlKind,
) -> Result<ControlFile, StepOutcome> {
    let name = qm.dest_name(dest);
    match ControlFile::read(&qm.spool().control_path(name, qid), kind) {
        Ok(control) => Ok(control),
        Err(Error::BadControlFile) | Err(Error::NxMessage) => {
            warn!("{}: entry {} is corrupt, quarantining", name, qid);
            if let Err(e) = qm.spool().quarantine(name, qid) {
                warn!("quarantine of {}/{} failed: {}", name, qid, e);
            }
            Err(StepOutcome::Abort)
        }
        Err(e) => {
            warn!("{}: can't read control for {}: {}", name, qid, e);
            Err(StepOutcome::Retry)
        }
    }
}

fn read_data(qm: &QueueManager, dest: Dest, qid: u64) -> Result<Vec<u8>, StepOutcome> {
    let name = qm.dest_name(dest);
    match fs::read(qm.spool().data_path(name, qid)) {
        Ok(data) => Ok(data),
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
            // Cannot happen after recovery, but a half-removed entry from
            // a crash during `remove` shows up this way.
            warn!("{}: entry {} has no data file", name, qid);
            if let Err(e) = qm.spool().quarantine(name, qid) {
                warn!("quarantine of {}/{} failed: {}", name, qid, e);
            }
            Err(StepOutcome::Abort)
        }
        Err(e) => {
            warn!("{}: can't read data for {}: {}", name, qid, e);
            Err(StepOutcome::Retry)
        }
    }
}

/// Process the head entry of the local queue.
///
/// Recipients whose routing information is older than the configured age
/// (or implausibly far in the future) are re-resolved first; mail for
/// boxes that moved away is respooled toward their new server. A `Retry`
/// may repeat deliveries already made this step, which the duplicate
/// message id check absorbs.
pub fn local_entry(
    qm: &QueueManager,
    delivery: &Delivery,
    qid: u64,
) -> StepOutcome {
    let control = match read_control(qm, Dest::Local, qid, ControlKind::Peer)
    {
        Ok(control) => control,
        Err(outcome) => return outcome,
    };
    let message = match read_data(qm, Dest::Local, qid) {
        Ok(message) => message,
        Err(outcome) => return outcome,
    };

    let recips = match control.recips {
        ControlRecips::Peer(ref recips) => recips,
        ControlRecips::Smtp(_) => unreachable!("decoded as peer variant"),
    };

    let tuning = &delivery.config().queue;
    let mut failures: Vec<(String, String)> = Vec::new();

    if count_hops(&message) > tuning.max_hops {
        warn!(
            "entry {} exceeded {} hops, bouncing",
            qid, tuning.max_hops
        );
        failures.extend(recips.iter().map(|r| {
            (
                r.name.clone(),
                RecipStatus::ForwardingLoop.reason().to_owned(),
            )
        }));
        bounce::send_bounce(
            delivery,
            &control.sender,
            &failures,
            header_of(&message).as_bytes(),
        );
        return StepOutcome::Done;
    }

    let now = Utc::now();
    let max_age = chrono::Duration::hours(tuning.resolve_max_age_hours);
    let skew = chrono::Duration::minutes(tuning.clock_skew_mins);

    for recip in recips {
        let age = now - recip.resolved_at;
        let stale = age > max_age || age < -skew;

        let target = if stale && !recip.uid.is_pseudo() {
            match delivery.directory().resolve_uid(recip.uid) {
                Ok(Lookup::Hosted {
                    uid,
                    server,
                    filesystem,
                }) => {
                    if server == delivery.config().server.name {
                        LocalTarget {
                            uid,
                            name: recip.name.clone(),
                            fs: delivery
                                .config()
                                .storage
                                .fs_index(&filesystem),
                            flags: recip.flags,
                        }
                    } else {
                        let mut moved = Recip::hosted(
                            recip.name.clone(),
                            uid,
                            server,
                            filesystem,
                        );
                        moved.flags = recip.flags;
                        failures.extend(delivery.redispatch(
                            &control.sender,
                            &moved,
                            &control.summary,
                            &message,
                        ));
                        continue;
                    }
                }
                Ok(_) => {
                    failures.push((
                        recip.name.clone(),
                        RecipStatus::BadAddress.reason().to_owned(),
                    ));
                    continue;
                }
                // Directory down; retry the whole entry later.
                Err(_) => return StepOutcome::Retry,
            }
        } else {
            LocalTarget {
                uid: recip.uid,
                name: recip.name.clone(),
                fs: delivery.config().storage.fs_index(&recip.filesystem),
                flags: recip.flags,
            }
        };

        match local::deliver_now(
            delivery,
            &target,
            &control.sender,
            &control.summary,
            &message,
        ) {
            LocalOutcome::Delivered
            | LocalOutcome::Duplicate
            | LocalOutcome::Forwarded => (),
            LocalOutcome::Failed(status) => failures
                .push((target.name.clone(), status.reason().to_owned())),
            LocalOutcome::Gone => {
                // The box left this server. If the directory already knows
                // its new home, chase it there with a fresh entry; otherwise
                // the move is still in flight, so wait it out.
                match delivery.directory().resolve_uid(target.uid) {
                    Ok(Lookup::Hosted {
                        uid,
                        server,
                        filesystem,
                    }) if server != delivery.config().server.name => {
                        let mut moved = Recip::hosted(
                            target.name.clone(),
                            uid,
                            server,
                            filesystem,
                        );
                        moved.flags = target.flags;
                        failures.extend(delivery.redispatch(
                            &control.sender,
                            &moved,
                            &control.summary,
                            &message,
                        ));
                    }
                    _ => return StepOutcome::Retry,
                }
            }
            LocalOutcome::Error(e) => {
                warn!(
                    "transient failure delivering {} to uid {}: {}",
                    qid, target.uid, e
                );
                return StepOutcome::Retry;
            }
        }
    }

    if !failures.is_empty() {
        bounce::send_bounce(
            delivery,
            &control.sender,
            &failures,
            header_of(&message).as_bytes(),
        );
    }

    StepOutcome::Done
}

/// Push the head entry of a peer queue to its server.
pub fn peer_entry(
    qm: &QueueManager,
    delivery: &Delivery,
    dest: Dest,
    qid: u64,
    peer: &PeerConfig,
    transport: &dyn PeerTransport,
    conn: &mut Option<Box<dyn PeerConn>>,
) -> StepOutcome {
    let control = match read_control(qm, dest, qid, ControlKind::Peer) {
        Ok(control) => control,
        Err(outcome) => return outcome,
    };
    let data = qm.spool().data_path(qm.dest_name(dest), qid);
    if !data.exists() {
        warn!("{}: entry {} has no data file", qm.dest_name(dest), qid);
        if let Err(e) = qm.spool().quarantine(qm.dest_name(dest), qid) {
            warn!("quarantine failed: {}", e);
        }
        return StepOutcome::Abort;
    }

    let mut c = match conn.take() {
        Some(c) => c,
        None => match transport.connect(peer) {
            Ok(c) => c,
            Err(e) => {
                warn!("can't reach {}: {}", peer.name, e);
                return StepOutcome::Retry;
            }
        },
    };

    match c.send_message(&control, &data) {
        Ok(XferOutcome::Done) => {
            *conn = Some(c);
            StepOutcome::Done
        }
        Ok(XferOutcome::Abort) => {
            *conn = Some(c);
            let failures: Vec<(String, String)> = match control.recips {
                ControlRecips::Peer(ref recips) => recips
                    .iter()
                    .map(|r| {
                        (
                            r.name.clone(),
                            format!("refused by server {}", peer.name),
                        )
                    })
                    .collect(),
                ControlRecips::Smtp(_) => Vec::new(),
            };
            let header = fs::read(&data)
                .map(|m| header_of(&m))
                .unwrap_or_default();
            bounce::send_bounce(
                delivery,
                &control.sender,
                &failures,
                header.as_bytes(),
            );
            StepOutcome::Abort
        }
        Ok(XferOutcome::Retry) => StepOutcome::Retry,
        Err(e) => {
            warn!("transfer to {} failed: {}", peer.name, e);
            StepOutcome::Retry
        }
    }
}

/// Hand the head entry of the SMTP queue to the mail system.
///
/// On partial success the control file is rewritten in place to hold only
/// the recipients worth retrying; the entry keeps its queue id and its
/// place at the head.
pub fn smtp_entry(
    qm: &QueueManager,
    delivery: &Delivery,
    qid: u64,
    transport: &dyn SmtpTransport,
    conn: &mut Option<Box<dyn SmtpConn>>,
) -> StepOutcome {
    let control = match read_control(qm, Dest::Internet, qid, ControlKind::Smtp)
    {
        Ok(control) => control,
        Err(outcome) => return outcome,
    };
    let addrs = match control.recips {
        ControlRecips::Smtp(ref addrs) => addrs.clone(),
        ControlRecips::Peer(_) => unreachable!("decoded as smtp variant"),
    };
    let data = qm.spool().data_path(qm.dest_name(Dest::Internet), qid);

    let mut c = match conn.take() {
        Some(c) => c,
        None => match transport.connect() {
            Ok(c) => c,
            Err(e) => {
                warn!("can't reach the mail system: {}", e);
                return StepOutcome::Retry;
            }
        },
    };

    let dispositions = match c.send_message(&control.sender, &addrs, &data) {
        Ok(dispositions) => {
            *conn = Some(c);
            dispositions
        }
        Err(e) => {
            warn!("SMTP hand-off for entry {} failed: {}", qid, e);
            return StepOutcome::Retry;
        }
    };

    let mut transient = Vec::new();
    let mut failures = Vec::new();
    for (addr, disposition) in dispositions {
        use crate::xfer::RecipDisposition::*;
        match disposition {
            Accepted => (),
            Transient => transient.push(addr),
            Permanent(reason) => failures.push((addr, reason)),
        }
    }

    if !failures.is_empty() {
        let header = fs::read(&data)
            .map(|m| header_of(&m))
            .unwrap_or_default();
        bounce::send_bounce(
            delivery,
            &control.sender,
            &failures,
            header.as_bytes(),
        );
    }

    if transient.is_empty() {
        return StepOutcome::Done;
    }

    let rewritten = ControlFile {
        sender: control.sender.clone(),
        summary: control.summary.clone(),
        recips: ControlRecips::Smtp(transient),
    };
    if let Err(e) = qm.spool().rewrite_control(
        qm.dest_name(Dest::Internet),
        qid,
        &rewritten,
    ) {
        warn!("can't rewrite control for entry {}: {}", qid, e);
    }
    StepOutcome::Retry
}

pub fn run_local(qm: Arc<QueueManager>, delivery: Arc<Delivery>) {
    let mut backoff = Backoff::from_tuning(&delivery.config().queue);
    info!("local delivery worker running");
    loop {
        let qid = qm.peek_blocking(Dest::Local);
        let outcome = local_entry(&qm, &delivery, qid);
        settle(&qm, Dest::Local, qid, outcome, &mut backoff);
    }
}

pub fn run_peer(
    qm: Arc<QueueManager>,
    delivery: Arc<Delivery>,
    dest: Dest,
    peer: PeerConfig,
    transport: Arc<dyn PeerTransport>,
) {
    let mut backoff = Backoff::from_tuning(&delivery.config().queue);
    let mut conn: Option<Box<dyn PeerConn>> = None;
    info!("transfer worker for {} running", peer.name);
    loop {
        let qid = qm.peek_blocking(dest);
        let outcome = peer_entry(
            &qm, &delivery, dest, qid, &peer, &*transport, &mut conn,
        );
        if StepOutcome::Retry == outcome {
            // Start the next attempt on a fresh connection.
            conn = None;
        }
        settle(&qm, dest, qid, outcome, &mut backoff);
    }
}

pub fn run_smtp(
    qm: Arc<QueueManager>,
    delivery: Arc<Delivery>,
    transport: Arc<dyn SmtpTransport>,
) {
    let mut backoff = Backoff::from_tuning(&delivery.config().queue);
    let mut conn: Option<Box<dyn SmtpConn>> = None;
    info!("SMTP worker running");
    loop {
        let qid = qm.peek_blocking(Dest::Internet);
        let outcome =
            smtp_entry(&qm, &delivery, qid, &*transport, &mut conn);
        settle(&qm, Dest::Internet, qid, outcome, &mut backoff);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::deliver::testutil::{
        Fixture, ScriptedPeer, ScriptedSmtp, UID_ALICE, UID_BOB, UID_CAROL,
    };
    use crate::mbox::model::{MessageId, Summary, SummaryFlags};
    use crate::queue::control::PeerRecip;
    use crate::support::system_config::UserEntry;
    use crate::xfer::RecipDisposition;

    const MESSAGE: &[u8] = b"Received: by alpha (Packmule); now\r\n\
                             From: carol\r\n\
                             Subject: hello\r\n\
                             \r\n\
                             body\r\n";

    fn summary(mid: u64) -> Summary {
        Summary {
            message_id: MessageId(mid),
            date: Utc::now(),
            size: MESSAGE.len() as u64,
            flags: SummaryFlags::UNREAD,
            sender: "carol".to_owned(),
            subject: "hello".to_owned(),
        }
    }

    fn peer_recip(uid: crate::mbox::model::Uid, name: &str) -> PeerRecip {
        PeerRecip {
            uid,
            filesystem: String::new(),
            resolved_at: Utc::now(),
            name: name.to_owned(),
            flags: crate::mbox::model::RecipFlags::empty(),
        }
    }

    fn stage_local(fix: &Fixture, recips: Vec<PeerRecip>) -> u64 {
        stage_local_message(fix, recips, MESSAGE)
    }

    fn stage_local_message(
        fix: &Fixture,
        recips: Vec<PeerRecip>,
        message: &[u8],
    ) -> u64 {
        let control = ControlFile {
            sender: "carol".to_owned(),
            summary: summary(40),
            recips: ControlRecips::Peer(recips),
        };
        fix.delivery
            .spool_to(Dest::Local, &control, message)
            .unwrap()
    }

    #[test]
    fn backoff_doubles_to_the_ceiling_and_resets() {
        let mut b = Backoff::new(
            Duration::from_secs(60),
            Duration::from_secs(960),
        );
        let delays: Vec<u64> =
            (0..6).map(|_| b.delay().as_secs()).collect();
        assert_eq!(vec![60, 120, 240, 480, 960, 960], delays);
        b.reset();
        assert_eq!(60, b.delay().as_secs());
    }

    #[test]
    fn only_success_resets_the_retry_delay() {
        let fix = Fixture::new();
        let mut backoff = Backoff::new(
            Duration::from_secs(60),
            Duration::from_secs(960),
        );
        backoff.delay();
        backoff.delay();

        let control = ControlFile {
            sender: "carol".to_owned(),
            summary: summary(41),
            recips: ControlRecips::Peer(vec![peer_recip(UID_ALICE, "alice")]),
        };
        let aborted = fix
            .delivery
            .spool_to(Dest::Peer(0), &control, MESSAGE)
            .unwrap();
        settle(
            &fix.queues,
            Dest::Peer(0),
            aborted,
            StepOutcome::Abort,
            &mut backoff,
        );
        // a permanent rejection says nothing about reachability
        assert_eq!(240, backoff.delay().as_secs());

        let done = fix
            .delivery
            .spool_to(Dest::Peer(0), &control, MESSAGE)
            .unwrap();
        settle(
            &fix.queues,
            Dest::Peer(0),
            done,
            StepOutcome::Done,
            &mut backoff,
        );
        assert_eq!(60, backoff.delay().as_secs());
    }

    #[test]
    fn local_worker_delivers_the_head_entry() {
        let fix = Fixture::new();
        let qid = stage_local(&fix, vec![peer_recip(UID_ALICE, "alice")]);

        assert_eq!(
            StepOutcome::Done,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert_eq!(1, fix.inbox(UID_ALICE).len());
    }

    #[test]
    fn stale_recipient_is_rerouted_to_its_new_server() {
        let fix = Fixture::new();
        // bob moved to beta since this entry was spooled
        fix.directory.insert(UserEntry {
            name: "bob".to_owned(),
            uid: UID_BOB.0,
            server: "beta".to_owned(),
            filesystem: String::new(),
        });

        let mut recip = peer_recip(UID_BOB, "bob");
        recip.resolved_at = Utc::now() - chrono::Duration::hours(48);
        let qid = stage_local(&fix, vec![recip]);

        assert_eq!(
            StepOutcome::Done,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert!(fix.inbox(UID_BOB).is_empty());
        assert_eq!(1, fix.queues.len(Dest::Peer(0)));
    }

    #[test]
    fn stale_unknown_recipient_is_bounced() {
        let fix = Fixture::new();
        let mut recip = peer_recip(crate::mbox::model::Uid(999), "ghost");
        recip.resolved_at = Utc::now() - chrono::Duration::hours(48);
        let qid = stage_local(&fix, vec![recip]);

        assert_eq!(
            StepOutcome::Done,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        let inbox = fix.inbox(UID_CAROL);
        assert_eq!(1, inbox.len());
        assert_eq!("Undeliverable mail", inbox[0].subject);
    }

    #[test]
    fn moved_mailbox_is_respooled_to_its_new_server() {
        let fix = Fixture::new();
        // bob's box has left this server and the directory already routes
        // him to beta
        fix.cache.find(UID_BOB, None, true).unwrap().lock().gone = true;
        fix.directory.insert(UserEntry {
            name: "bob".to_owned(),
            uid: UID_BOB.0,
            server: "beta".to_owned(),
            filesystem: String::new(),
        });

        // the routing information is fresh, so the age check alone would
        // never re-resolve this recipient
        let qid = stage_local(&fix, vec![peer_recip(UID_BOB, "bob")]);

        assert_eq!(
            StepOutcome::Done,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert_eq!(1, fix.queues.len(Dest::Peer(0)));
        // chased, not bounced
        assert!(fix.inbox(UID_CAROL).is_empty());
    }

    #[test]
    fn mid_move_mailbox_is_retried_not_bounced() {
        let fix = Fixture::new();
        // gone on disk, but the directory still says the box is here: the
        // move has not completed yet
        fix.cache.find(UID_BOB, None, true).unwrap().lock().gone = true;

        let qid = stage_local(&fix, vec![peer_recip(UID_BOB, "bob")]);

        assert_eq!(
            StepOutcome::Retry,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert_eq!(0, fix.queues.len(Dest::Peer(0)));
        assert!(fix.inbox(UID_CAROL).is_empty());
    }

    #[test]
    fn hop_limit_exceeded_is_bounced_not_delivered() {
        let fix = Fixture::new();
        let mut message = Vec::new();
        for _ in 0..fix.config.queue.max_hops + 1 {
            message
                .extend_from_slice(b"Received: by alpha (Packmule); x\r\n");
        }
        message.extend_from_slice(b"From: carol\r\n\r\nbody\r\n");

        let qid = stage_local_message(
            &fix,
            vec![peer_recip(UID_ALICE, "alice")],
            &message,
        );

        assert_eq!(
            StepOutcome::Done,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert!(fix.inbox(UID_ALICE).is_empty());
        let inbox = fix.inbox(UID_CAROL);
        assert_eq!(1, inbox.len());
        let text =
            String::from_utf8_lossy(&fix.inbox_message(UID_CAROL, 0))
                .into_owned();
        assert!(text.contains("forwarding loop"));
    }

    #[test]
    fn corrupt_control_file_is_quarantined() {
        let fix = Fixture::new();
        let spool = fix.queues.spool();
        let qid = fix.queues.next_qid();
        std::fs::write(spool.control_path("local", qid), b"garbage")
            .unwrap();
        std::fs::write(spool.data_path("local", qid), MESSAGE).unwrap();
        fix.queues.enqueue(Dest::Local, qid);

        assert_eq!(
            StepOutcome::Abort,
            local_entry(&fix.queues, &fix.delivery, qid)
        );
        assert!(!spool.control_path("local", qid).exists());
        assert!(std::fs::read_dir(spool.bad_dir()).unwrap().count() >= 1);
    }

    #[test]
    fn smtp_partial_failure_rewrites_the_entry_and_bounces() {
        let fix = Fixture::new();
        let control = ControlFile {
            sender: "carol".to_owned(),
            summary: summary(50),
            recips: ControlRecips::Smtp(vec![
                "a@ok.example".to_owned(),
                "b@slow.example".to_owned(),
                "c@dead.example".to_owned(),
            ]),
        };
        let qid = fix
            .delivery
            .spool_to(Dest::Internet, &control, MESSAGE)
            .unwrap();

        fix.smtp.push_script(vec![
            ("a@ok.example".to_owned(), RecipDisposition::Accepted),
            ("b@slow.example".to_owned(), RecipDisposition::Transient),
            (
                "c@dead.example".to_owned(),
                RecipDisposition::Permanent("user unknown".to_owned()),
            ),
        ]);

        let smtp: &ScriptedSmtp = &fix.smtp;
        let mut conn = None;
        assert_eq!(
            StepOutcome::Retry,
            smtp_entry(&fix.queues, &fix.delivery, qid, smtp, &mut conn)
        );

        // only the transient recipient is left in the entry
        let rewritten = ControlFile::read(
            &fix.queues.spool().control_path("smtp", qid),
            ControlKind::Smtp,
        )
        .unwrap();
        assert_eq!(
            ControlRecips::Smtp(vec!["b@slow.example".to_owned()]),
            rewritten.recips
        );

        // the permanent failure was bounced to the sender
        let text =
            String::from_utf8_lossy(&fix.inbox_message(UID_CAROL, 0))
                .into_owned();
        assert!(text.contains("c@dead.example"));
        assert!(text.contains("user unknown"));

        // a later attempt that accepts everything finishes the entry
        assert_eq!(
            StepOutcome::Done,
            smtp_entry(&fix.queues, &fix.delivery, qid, smtp, &mut conn)
        );
        let sent = fix.smtp.state.sent.lock().unwrap();
        assert_eq!(
            vec!["b@slow.example".to_owned()],
            sent.last().unwrap().1
        );
    }

    #[test]
    fn peer_refusal_bounces_and_disposes_of_the_entry() {
        let fix = Fixture::new();
        let control = ControlFile {
            sender: "carol".to_owned(),
            summary: summary(60),
            recips: ControlRecips::Peer(vec![peer_recip(
                crate::mbox::model::Uid(200),
                "dave",
            )]),
        };
        let qid = fix
            .delivery
            .spool_to(Dest::Peer(0), &control, MESSAGE)
            .unwrap();

        let transport = ScriptedPeer::new();
        transport.push_script(XferOutcome::Abort);
        let mut conn = None;
        assert_eq!(
            StepOutcome::Abort,
            peer_entry(
                &fix.queues,
                &fix.delivery,
                Dest::Peer(0),
                qid,
                &fix.config.peers[0],
                &transport,
                &mut conn,
            )
        );

        let text =
            String::from_utf8_lossy(&fix.inbox_message(UID_CAROL, 0))
                .into_owned();
        assert!(text.contains("refused by server beta"));
    }

    #[test]
    fn peer_retry_leaves_the_entry_at_the_head() {
        let fix = Fixture::new();
        let control = ControlFile {
            sender: "carol".to_owned(),
            summary: summary(61),
            recips: ControlRecips::Peer(vec![peer_recip(
                crate::mbox::model::Uid(200),
                "dave",
            )]),
        };
        let qid = fix
            .delivery
            .spool_to(Dest::Peer(0), &control, MESSAGE)
            .unwrap();

        let transport = ScriptedPeer::new();
        transport.push_script(XferOutcome::Retry);
        let mut conn = None;

        assert_eq!(
            StepOutcome::Retry,
            peer_entry(
                &fix.queues,
                &fix.delivery,
                Dest::Peer(0),
                qid,
                &fix.config.peers[0],
                &transport,
                &mut conn,
            )
        );
        assert_eq!(Some(qid), fix.queues.try_peek(Dest::Peer(0)));
        assert!(fix
            .queues
            .spool()
            .control_path("beta", qid)
            .exists());

        assert_eq!(
            StepOutcome::Done,
            peer_entry(
                &fix.queues,
                &fix.delivery,
                Dest::Peer(0),
                qid,
                &fix.config.peers[0],
                &transport,
                &mut conn,
            )
        );
        assert_eq!(vec![1, 1], *transport.state.sent.lock().unwrap());
    }
}
