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

//! Vacation autoreplies.
//!
//! An autoreply goes to the originator of an incoming message, at most
//! once per originator per vacation (tracked in the box's vacation log),
//! and never in response to bulk or broadcast-addressed mail or to
//! addresses that look like another piece of software.

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::mbox::cache::BoxRef;

use super::engine::{header_of, DeliverReq, Delivery};

lazy_static! {
    static ref RE_PRECEDENCE: Regex =
        Regex::new(r"(?mi)^precedence:[ \t]*(bulk|junk|list)\b").unwrap();
    /// Reply source headers in priority order are picked out of this
    /// match set afterwards.
    static ref RE_SOURCE: Regex =
        Regex::new(r"(?mi)^(reply-to|from|sender):[ \t]*(.+?)[ \t\r]*$")
            .unwrap();
    /// Addresses that are mail software rather than people. Replying to
    /// these invites a loop.
    static ref RE_REFLECTOR: Regex = Regex::new(
        r"(?i)(daemon|mailer|postmaster|uucp|listserv|-request\b|-relay\b)"
    )
    .unwrap();
    /// To/Cc lines addressed to an audience rather than a person. The
    /// nominal sender of such mail rarely wants to hear back from every
    /// absent recipient.
    static ref RE_BROADCAST: Regex = Regex::new(
        r"(?mi)^(to|cc):.*(all[ -]users|everyone\b|undisclosed[ -]recipients|multiple recipients)"
    )
    .unwrap();
}

/// Decide who, if anyone, should get an autoreply to this message.
pub fn autoreply_target(header: &str) -> Option<String> {
    if RE_PRECEDENCE.is_match(header) || RE_BROADCAST.is_match(header) {
        return None;
    }

    let mut reply_to = None;
    let mut from = None;
    let mut sender = None;
    for caps in RE_SOURCE.captures_iter(header) {
        let field = caps[1].to_ascii_lowercase();
        let value = caps[2].to_owned();
        let slot = match field.as_str() {
            "reply-to" => &mut reply_to,
            "from" => &mut from,
            _ => &mut sender,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    let source = reply_to.or(from).or(sender)?;
    let addr = extract_addr(&source);
    if addr.is_empty() || RE_REFLECTOR.is_match(&addr) {
        return None;
    }
    Some(addr)
}

/// `Display Name <addr>` or a bare address.
fn extract_addr(field: &str) -> String {
    match (field.find('<'), field.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            field[open + 1..close].trim().to_owned()
        }
        _ => field.trim().to_owned(),
    }
}

/// Send the autoreply for one just-delivered message, if one is due.
///
/// `boxed` is the recipient's mailbox, pinned but not locked; it is locked
/// briefly to consult and update the vacation log, never across the send.
pub fn maybe_autoreply(
    delivery: &Delivery,
    boxed: &BoxRef,
    user_name: &str,
    text: &str,
    message: &[u8],
) {
    let header = header_of(message);
    let target = match autoreply_target(&header) {
        Some(target) => target,
        None => return,
    };
    if target.eq_ignore_ascii_case(user_name) {
        return;
    }

    match boxed.lock().vacation_replied(&target) {
        Ok(true) => {
            debug!("{} already got a vacation reply", target);
            return;
        }
        Ok(false) => (),
        Err(e) => {
            warn!("can't read vacation log for {}: {}", user_name, e);
            return;
        }
    }

    let recip = delivery.resolve_one(&target);
    if !recip.status.is_ok() {
        warn!(
            "not sending vacation reply to {:?}: {}",
            target,
            recip.status.reason()
        );
        return;
    }

    let mut req = DeliverReq::new(user_name, user_name);
    req.system = true;
    req.subject = format!("Vacation notice from {}", user_name);
    req.to = vec![recip];
    req.body = text.as_bytes().to_vec();

    match delivery.deliver(&req) {
        Ok(_) => {
            if let Err(e) = boxed.lock().record_vacation_reply(&target) {
                warn!(
                    "can't record vacation reply for {}: {}",
                    user_name, e
                );
            }
        }
        Err(e) => warn!("can't send vacation reply: {}", e),
    }
}
