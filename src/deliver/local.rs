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

//! Delivery into mailboxes hosted on this server.
//!
//! Everything that can spawn further mail (forwarding, vacation replies,
//! bounces) is collected as a post-action while the box lock is held and
//! executed only after the lock is released, since sending mail may need
//! to lock other boxes.

use log::{debug, warn};

use crate::mbox::model::{
    RecipFlags, RecipStatus, Summary, Uid, FOLDER_INBOX,
};
use crate::notify::NewMail;
use crate::support::error::Error;

use super::engine::{add_hop, count_hops, header_of, Delivery};
use super::{bounce, vacation};

/// Mailbox preference naming another recipient all mail is passed on to.
const PREF_FORWARD: &str = "forward-to";
/// Mailbox preference holding the vacation autoreply text.
const PREF_VACATION: &str = "vacation";

/// One local recipient of one rendered message.
pub struct LocalTarget {
    pub uid: Uid,
    pub name: String,
    /// Index of the disk volume known to hold the box, if known.
    pub fs: Option<usize>,
    pub flags: RecipFlags,
}

#[derive(Debug)]
pub enum LocalOutcome {
    Delivered,
    /// The box already holds this message id; redelivery is benign.
    Duplicate,
    /// Passed on to the box's forwarding address instead.
    Forwarded,
    /// The box left this server after the recipient was resolved.
    Gone,
    /// Permanent failure; the sender gets a bounce.
    Failed(RecipStatus),
    /// Transient failure; worth retrying.
    Error(Error),
}

enum Post {
    Notify,
    Vacation(String),
    Forward(String),
}

/// Deliver one rendered message into one mailbox hosted here.
pub fn deliver_now(
    delivery: &Delivery,
    target: &LocalTarget,
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
) -> LocalOutcome {
    if target.uid.is_pseudo() {
        return deliver_broadcast(
            delivery,
            target,
            sender_addr,
            summary,
            message,
        );
    }

    let r = match delivery.cache.find(target.uid, target.fs, false) {
        Ok(r) => r,
        Err(e) => return LocalOutcome::Error(e),
    };

    let mut outcome = LocalOutcome::Delivered;
    let mut post: Vec<Post> = Vec::new();
    {
        let mut state = r.lock();

        let forward = if target.flags.contains(RecipFlags::ONESHOT) {
            None
        } else {
            match state.pref(PREF_FORWARD) {
                Ok(Some(f)) if !f.is_empty() && f != target.name => Some(f),
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        "can't read prefs for uid {}: {}",
                        target.uid, e
                    );
                    None
                }
            }
        };

        if let Some(fwd) = forward {
            post.push(Post::Forward(fwd));
        } else {
            match state.append_message(FOLDER_INBOX, summary.clone(), message)
            {
                Ok(()) => {
                    post.push(Post::Notify);
                    if !target.flags.contains(RecipFlags::VACATION) {
                        if let Ok(Some(text)) = state.pref(PREF_VACATION) {
                            post.push(Post::Vacation(text));
                        }
                    }
                }
                Err(Error::MailboxGone) => return LocalOutcome::Gone,
                Err(Error::DuplicateMessage) => {
                    debug!(
                        "uid {} already has mid {}",
                        target.uid, summary.message_id
                    );
                    outcome = LocalOutcome::Duplicate;
                }
                Err(e) => return LocalOutcome::Error(e),
            }
        }
    }

    // Box lock released; the pin on `r` keeps the entry alive.
    for action in post {
        match action {
            Post::Notify => delivery.notifier.new_mail(NewMail {
                uid: target.uid,
                message_id: summary.message_id,
                folder: FOLDER_INBOX,
            }),
            Post::Vacation(text) => vacation::maybe_autoreply(
                delivery,
                &r,
                &target.name,
                &text,
                message,
            ),
            Post::Forward(fwd) => {
                outcome = forward(
                    delivery,
                    target,
                    &fwd,
                    sender_addr,
                    summary,
                    message,
                );
            }
        }
    }

    outcome
}

/// A pseudo-recipient addressed to this server: deliver to every user
/// hosted here. Best-effort; individual failures are logged, not bounced.
fn deliver_broadcast(
    delivery: &Delivery,
    target: &LocalTarget,
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
) -> LocalOutcome {
    let uids = match delivery
        .directory
        .hosted_uids(&delivery.config().server.name)
    {
        Ok(uids) => uids,
        Err(e) => return LocalOutcome::Error(e),
    };

    debug!(
        "expanding broadcast {} to {} local user(s)",
        target.uid,
        uids.len()
    );

    for uid in uids {
        let each = LocalTarget {
            uid,
            name: target.name.clone(),
            fs: None,
            // broadcasts never trigger autoreplies or forwarding
            flags: target.flags
                | RecipFlags::VACATION
                | RecipFlags::ONESHOT,
        };
        match deliver_now(delivery, &each, sender_addr, summary, message) {
            LocalOutcome::Delivered | LocalOutcome::Duplicate => (),
            LocalOutcome::Forwarded | LocalOutcome::Gone => (),
            LocalOutcome::Failed(status) => warn!(
                "broadcast to uid {} failed: {}",
                uid,
                status.reason()
            ),
            LocalOutcome::Error(e) => {
                warn!("broadcast to uid {} failed: {}", uid, e)
            }
        }
    }

    LocalOutcome::Delivered
}

/// Pass the message on to a box's forwarding address.
fn forward(
    delivery: &Delivery,
    target: &LocalTarget,
    fwd: &str,
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
) -> LocalOutcome {
    if count_hops(message) >= delivery.config().queue.max_hops {
        warn!(
            "forwarding loop: uid {} -> {:?} after {} hops",
            target.uid,
            fwd,
            count_hops(message)
        );
        return LocalOutcome::Failed(RecipStatus::ForwardingLoop);
    }

    let mut recip = delivery.resolve_one(fwd);
    if !recip.status.is_ok() {
        // A dangling forwarding address should not lose mail; deliver to
        // the box itself instead.
        warn!(
            "uid {} forwards to {:?} which does not resolve ({}); \
             delivering locally",
            target.uid,
            fwd,
            recip.status.reason()
        );
        let keep = LocalTarget {
            uid: target.uid,
            name: target.name.clone(),
            fs: target.fs,
            flags: target.flags | RecipFlags::ONESHOT,
        };
        return deliver_now(delivery, &keep, sender_addr, summary, message);
    }

    let bumped = add_hop(&delivery.config().server.name, message);
    let mut fwd_summary = summary.clone();
    fwd_summary.size = bumped.len() as u64;
    recip.flags |= target.flags & RecipFlags::VACATION;

    let failures =
        delivery.redispatch(sender_addr, &recip, &fwd_summary, &bumped);
    if !failures.is_empty() {
        bounce::send_bounce(
            delivery,
            sender_addr,
            &failures,
            header_of(&bumped).as_bytes(),
        );
    }
    LocalOutcome::Forwarded
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::prelude::*;

    use crate::deliver::testutil::{Fixture, UID_ALICE, UID_BOB, UID_CAROL};
    use crate::mbox::model::MessageId;

    fn target(uid: Uid, name: &str) -> LocalTarget {
        LocalTarget {
            uid,
            name: name.to_owned(),
            fs: None,
            flags: RecipFlags::empty(),
        }
    }

    fn summary(mid: u64, message: &[u8]) -> Summary {
        Summary {
            message_id: MessageId(mid),
            date: Utc::now(),
            size: message.len() as u64,
            flags: crate::mbox::model::SummaryFlags::UNREAD,
            sender: "carol".to_owned(),
            subject: "hello".to_owned(),
        }
    }

    fn set_pref(fix: &Fixture, uid: Uid, key: &str, value: &str) {
        let r = fix.cache.find(uid, None, true).unwrap();
        r.lock().set_pref(key, value).unwrap();
    }

    const MESSAGE: &[u8] = b"Received: by alpha (Packmule); now\r\n\
                             From: carol\r\n\
                             Subject: hello\r\n\
                             \r\n\
                             body\r\n";

    #[test]
    fn duplicate_redelivery_is_benign() {
        let fix = Fixture::new();
        let s = summary(7, MESSAGE);

        assert_matches!(
            LocalOutcome::Delivered,
            deliver_now(
                &fix.delivery,
                &target(UID_BOB, "bob"),
                "carol",
                &s,
                MESSAGE,
            )
        );
        assert_matches!(
            LocalOutcome::Duplicate,
            deliver_now(
                &fix.delivery,
                &target(UID_BOB, "bob"),
                "carol",
                &s,
                MESSAGE,
            )
        );
        assert_eq!(1, fix.inbox(UID_BOB).len());
    }

    #[test]
    fn forwarding_pref_redirects_delivery() {
        let fix = Fixture::new();
        set_pref(&fix, UID_ALICE, PREF_FORWARD, "bob");

        let s = summary(8, MESSAGE);
        assert_matches!(
            LocalOutcome::Forwarded,
            deliver_now(
                &fix.delivery,
                &target(UID_ALICE, "alice"),
                "carol",
                &s,
                MESSAGE,
            )
        );

        assert!(fix.inbox(UID_ALICE).is_empty());
        let inbox = fix.inbox(UID_BOB);
        assert_eq!(1, inbox.len());
        // the forwarded copy carries an extra hop line
        let text = fix.inbox_message(UID_BOB, 0);
        assert_eq!(2, count_hops(&text));
    }

    #[test]
    fn dangling_forward_falls_back_to_local_delivery() {
        let fix = Fixture::new();
        set_pref(&fix, UID_ALICE, PREF_FORWARD, "nonesuch");

        let s = summary(9, MESSAGE);
        assert_matches!(
            LocalOutcome::Delivered,
            deliver_now(
                &fix.delivery,
                &target(UID_ALICE, "alice"),
                "carol",
                &s,
                MESSAGE,
            )
        );
        assert_eq!(1, fix.inbox(UID_ALICE).len());
    }

    #[test]
    fn forwarding_loop_bounces_to_the_sender() {
        let fix = Fixture::with_config(|c| c.queue.max_hops = 2);
        set_pref(&fix, UID_ALICE, PREF_FORWARD, "bob");
        set_pref(&fix, UID_BOB, PREF_FORWARD, "alice");

        let s = summary(10, MESSAGE);
        deliver_now(
            &fix.delivery,
            &target(UID_ALICE, "alice"),
            "carol",
            &s,
            MESSAGE,
        );

        assert!(fix.inbox(UID_ALICE).is_empty());
        assert!(fix.inbox(UID_BOB).is_empty());
        let inbox = fix.inbox(UID_CAROL);
        assert_eq!(1, inbox.len());
        assert_eq!("Undeliverable mail", inbox[0].subject);
    }

    #[test]
    fn vacation_reply_sent_once_per_originator() {
        let fix = Fixture::new();
        set_pref(&fix, UID_ALICE, PREF_VACATION, "away until Monday");

        for mid in &[20, 21] {
            let s = summary(*mid, MESSAGE);
            deliver_now(
                &fix.delivery,
                &target(UID_ALICE, "alice"),
                "carol",
                &s,
                MESSAGE,
            );
        }

        assert_eq!(2, fix.inbox(UID_ALICE).len());
        let carol = fix.inbox(UID_CAROL);
        assert_eq!(1, carol.len());
        assert!(carol[0].subject.contains("Vacation notice"));
        let text = String::from_utf8_lossy(
            &fix.inbox_message(UID_CAROL, 0),
        )
        .into_owned();
        assert!(text.contains("away until Monday"));
    }

    #[test]
    fn bulk_mail_gets_no_vacation_reply() {
        let fix = Fixture::new();
        set_pref(&fix, UID_ALICE, PREF_VACATION, "away");

        let message = b"From: carol\r\nPrecedence: bulk\r\n\r\nbody\r\n";
        let s = summary(30, message);
        deliver_now(
            &fix.delivery,
            &target(UID_ALICE, "alice"),
            "carol",
            &s,
            message,
        );

        assert_eq!(1, fix.inbox(UID_ALICE).len());
        assert!(fix.inbox(UID_CAROL).is_empty());
    }

    #[test]
    fn redelivery_never_repeats_a_vacation_reply() {
        let fix = Fixture::new();
        set_pref(&fix, UID_ALICE, PREF_VACATION, "away");

        let s = summary(31, MESSAGE);
        let mut t = target(UID_ALICE, "alice");
        t.flags |= RecipFlags::VACATION;
        deliver_now(&fix.delivery, &t, "carol", &s, MESSAGE);

        assert_eq!(1, fix.inbox(UID_ALICE).len());
        assert!(fix.inbox(UID_CAROL).is_empty());
    }
}
