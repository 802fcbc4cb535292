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

//! Failure notices back to the sender.

use log::{error, warn};

use crate::mbox::model::SummaryFlags;

use super::engine::{DeliverReq, Delivery};

/// Tell `sender_addr` that some recipients of their message failed.
///
/// Bounces are sent from the postmaster address and never *to* it: a
/// failure of postmaster mail is only logged, which is what breaks the
/// bounce-of-bounce loop.
pub fn send_bounce(
    delivery: &Delivery,
    sender_addr: &str,
    failures: &[(String, String)],
    original_header: &[u8],
) {
    let postmaster = &delivery.config().server.postmaster;
    if sender_addr.is_empty()
        || sender_addr.eq_ignore_ascii_case(postmaster)
    {
        warn!(
            "suppressing bounce to {:?} for {} recipient(s)",
            sender_addr,
            failures.len()
        );
        return;
    }

    let recip = delivery.resolve_one(sender_addr);
    if !recip.status.is_ok() {
        warn!(
            "can't bounce to {:?}: {}",
            sender_addr,
            recip.status.reason()
        );
        return;
    }

    let mut body =
        String::from("Your message could not be delivered to:\r\n\r\n");
    for (name, reason) in failures {
        body.push_str(&format!("    {}: {}\r\n", name, reason));
    }
    body.push_str("\r\n----- Original message header -----\r\n");
    body.push_str(&String::from_utf8_lossy(original_header));
    body.push_str("\r\n");

    let mut req = DeliverReq::new("Mail System", postmaster.clone());
    req.system = true;
    req.flags = SummaryFlags::UNREAD | SummaryFlags::URGENT;
    req.subject = "Undeliverable mail".to_owned();
    req.to = vec![recip];
    req.body = body.into_bytes();

    if let Err(e) = delivery.deliver(&req) {
        error!("can't deliver bounce to {:?}: {}", sender_addr, e);
    }
}
