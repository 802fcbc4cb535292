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

use std::io::{self, Read};
use std::sync::Arc;

use crate::deliver::{DeliverReq, Delivery};
use crate::dnd::{Directory, Lookup, StaticDirectory};
use crate::mbox::cache::MboxCache;
use crate::mbox::model::SummaryFlags;
use crate::notify::LogNotifier;
use crate::queue::manager::QueueManager;
use crate::support::system_config::SystemConfig;
use crate::xfer::{MtaSmtpTransport, SmtpTransport};

use super::main::DeliverSubcommand;

pub fn deliver(system_config: SystemConfig, cmd: DeliverSubcommand) {
    let config = Arc::new(system_config);

    let sender_name = cmd
        .from
        .clone()
        .unwrap_or_else(|| config.server.postmaster.clone());

    let directory = Arc::new(StaticDirectory::from_config(&config));
    let sender_uid = match directory.resolve(&sender_name) {
        Ok(Lookup::Hosted { uid, .. }) => Some(uid),
        Ok(Lookup::NoSuchUser) if cmd.from.is_some() => {
            die!(EX_NOUSER, "No such user: {}", sender_name)
        }
        Ok(_) => None,
        Err(e) => die!(EX_UNAVAILABLE, "Directory lookup failed: {}", e),
    };

    let cache = MboxCache::new(
        Arc::clone(&config),
        Arc::clone(&directory) as Arc<dyn Directory>,
    );
    let queues = match QueueManager::new(&config) {
        Ok(qm) => Arc::new(qm),
        Err(e) => die!(
            EX_IOERR,
            "Unable to open the spool at '{}': {}",
            config.storage.spool.display(),
            e
        ),
    };
    let smtp: Arc<dyn SmtpTransport> =
        Arc::new(MtaSmtpTransport::new(config.smtp.clone()));
    let delivery = match Delivery::new(
        Arc::clone(&config),
        Arc::clone(&cache),
        queues,
        Arc::clone(&directory) as Arc<dyn Directory>,
        Arc::new(LogNotifier),
        smtp,
    ) {
        Ok(d) => d,
        Err(e) => {
            die!(EX_IOERR, "Unable to open the message-id allocator: {}", e)
        }
    };

    let mut body = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut body) {
        die!(EX_IOERR, "Error reading message from stdin: {}", e);
    }
    let body = fix_line_endings(body);

    let mut req = DeliverReq::new(sender_name.clone(), sender_name);
    req.sender_uid = sender_uid;
    req.subject = cmd.subject;
    req.hide_recipients = cmd.hide_recipients;
    if cmd.urgent {
        req.flags |= SummaryFlags::URGENT;
    }
    req.to = delivery.resolve_recipients(sender_uid, &cmd.recipients);
    req.body = body;

    match delivery.deliver(&req) {
        Ok(mid) => {
            // Deliveries into hosted boxes live only in the cache until it
            // is written back.
            cache.flush_all(true);
            println!("delivered, message id {}", mid);
        }
        Err(e) => die!(EX_IOERR, "Delivery failed: {}", e),
    }
}

/// If the first line ends with a UNIX line ending, rewrite every line feed
/// as a DOS one; otherwise return the input unchanged.
fn fix_line_endings(data: Vec<u8>) -> Vec<u8> {
    let unix = match data.iter().position(|&b| b'\n' == b) {
        Some(0) => true,
        Some(ix) => b'\r' != data[ix - 1],
        None => return data,
    };
    if !unix {
        return data;
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    for byte in data {
        if b'\n' == byte {
            out.push(b'\r');
        }
        out.push(byte);
    }
    out
}
