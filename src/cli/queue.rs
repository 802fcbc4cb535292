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

use crate::queue::control::{ControlFile, ControlKind};
use crate::queue::manager::{LOCAL_DEST, SMTP_DEST};
use crate::queue::spool::Spool;
use crate::support::system_config::SystemConfig;

/// List every entry in every destination queue.
///
/// Reads the spool directly rather than going through a `QueueManager`, so
/// that a listing never triggers recovery or quarantining on a spool the
/// running server owns.
pub fn list(system_config: SystemConfig) {
    let spool = match Spool::new(system_config.storage.spool.clone()) {
        Ok(spool) => spool,
        Err(e) => die!(
            EX_IOERR,
            "Unable to open the spool at '{}': {}",
            system_config.storage.spool.display(),
            e
        ),
    };

    let mut dests = vec![
        (LOCAL_DEST.to_owned(), ControlKind::Peer),
        (SMTP_DEST.to_owned(), ControlKind::Smtp),
    ];
    for peer in &system_config.peers {
        dests.push((peer.name.clone(), ControlKind::Peer));
    }

    println!(
        "{:8} {:>6} {:>8} {:16} {:>8} {:>6} {:24} SUBJECT",
        "QUEUE", "QID", "MID", "DATE", "SIZE", "RCPTS", "SENDER"
    );

    for (dest, kind) in dests {
        let qids = match spool.list(&dest) {
            Ok(qids) => qids,
            // A peer added to the configuration since the server last ran
            // has no directory yet.
            Err(_) => continue,
        };

        for qid in qids {
            // The server may transfer and remove an entry mid-listing.
            let control =
                match ControlFile::read(&spool.control_path(&dest, qid), kind)
                {
                    Ok(control) => control,
                    Err(e) => {
                        eprintln!("{} {}: unreadable: {}", dest, qid, e);
                        continue;
                    }
                };

            println!(
                "{:8} {:>6} {:>8} {:16} {:>8} {:>6} {:24} {}",
                dest,
                qid,
                control.summary.message_id,
                control.summary.date.format("%Y-%m-%d %H:%M"),
                control.summary.size,
                control.recips.len(),
                control.sender,
                control.summary.subject,
            );
        }
    }
}
