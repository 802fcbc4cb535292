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

//! Partitioning hosted recipients across servers.
//!
//! Recipients hosted here are delivered in-process; each remote partition
//! becomes one spooled entry in that peer's queue. Pseudo-recipients are
//! exploded into per-server targets first, so a broadcast is one queue
//! entry per peer, not one per user.

use std::collections::BTreeMap;

use log::warn;

use crate::dnd::Lookup;
use crate::mbox::model::{
    Recip, RecipAddr, Summary, UID_ALL_USERS, UID_LIST_UPDATE,
};
use crate::queue::control::{ControlFile, ControlRecips, PeerRecip};
use crate::queue::manager::Dest;

use super::engine::Delivery;
use super::local::{self, LocalOutcome, LocalTarget};

/// Deliver `recips` (all hosted) from one rendered message variant.
/// Returns `(name, reason)` for every recipient that permanently failed.
pub(super) fn dispatch_hosted(
    delivery: &Delivery,
    recips: &[&Recip],
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    let mut local_targets: Vec<LocalTarget> = Vec::new();
    // server name -> recipients, deterministic order
    let mut remote: BTreeMap<String, Vec<PeerRecip>> = BTreeMap::new();

    let own_server = &delivery.config().server.name;

    for recip in recips {
        let (uid, server, filesystem) = match recip.addr {
            RecipAddr::Hosted {
                uid,
                ref server,
                ref filesystem,
            } => (uid, server, filesystem),
            RecipAddr::Internet { .. } => continue,
        };

        let servers: Vec<&str> = if UID_ALL_USERS == uid {
            std::iter::once(own_server.as_str())
                .chain(delivery.config().peers.iter().map(|p| p.name.as_str()))
                .collect()
        } else if UID_LIST_UPDATE == uid {
            delivery.config().peers.iter().map(|p| p.name.as_str()).collect()
        } else {
            vec![server.as_str()]
        };

        for server in servers {
            if server == own_server {
                local_targets.push(LocalTarget {
                    uid,
                    name: recip.name.clone(),
                    fs: delivery.config().storage.fs_index(filesystem),
                    flags: recip.flags,
                });
            } else {
                remote.entry(server.to_owned()).or_default().push(PeerRecip {
                    uid,
                    filesystem: filesystem.clone(),
                    resolved_at: recip.resolved_at,
                    name: recip.name.clone(),
                    flags: recip.flags,
                });
            }
        }
    }

    for target in &local_targets {
        deliver_local_target(
            delivery,
            target,
            sender_addr,
            summary,
            message,
            &mut failures,
        );
    }

    for (server, partition) in remote {
        let dest = match delivery.queues().dest_of_server(&server) {
            Some(dest) => dest,
            None => {
                warn!("no route to server {:?}", server);
                failures.extend(partition.into_iter().map(|r| {
                    (
                        r.name,
                        format!("no route to server {}", server),
                    )
                }));
                continue;
            }
        };

        let control = ControlFile {
            sender: sender_addr.to_owned(),
            summary: summary.clone(),
            recips: ControlRecips::Peer(partition.clone()),
        };
        if let Err(e) = delivery.spool_to(dest, &control, message) {
            warn!("can't spool for {}: {}", server, e);
            failures.extend(partition.into_iter().map(|r| {
                (r.name, "the outgoing mail spool is unavailable".to_owned())
            }));
        }
    }

    failures
}

/// Deliver one local target, falling back to the local retry queue on
/// transient trouble.
pub(super) fn deliver_local_target(
    delivery: &Delivery,
    target: &LocalTarget,
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
    failures: &mut Vec<(String, String)>,
) {
    match local::deliver_now(delivery, target, sender_addr, summary, message)
    {
        LocalOutcome::Delivered
        | LocalOutcome::Duplicate
        | LocalOutcome::Forwarded => (),
        LocalOutcome::Failed(status) => {
            failures.push((target.name.clone(), status.reason().to_owned()))
        }
        LocalOutcome::Gone => {
            // The box moved between resolution and delivery. Ask the
            // directory where it went and chase it once; the worker on
            // the far side does any further chasing.
            match delivery.directory.resolve_uid(target.uid) {
                Ok(Lookup::Hosted {
                    uid,
                    ref server,
                    ref filesystem,
                }) if server != &delivery.config().server.name => {
                    let mut moved = Recip::hosted(
                        target.name.clone(),
                        uid,
                        server.clone(),
                        filesystem.clone(),
                    );
                    moved.flags = target.flags;
                    failures.extend(delivery.redispatch(
                        sender_addr,
                        &moved,
                        summary,
                        message,
                    ));
                }
                other => {
                    warn!(
                        "box {} gone but directory says {:?}",
                        target.uid, other
                    );
                    requeue_local(
                        delivery,
                        target,
                        sender_addr,
                        summary,
                        message,
                        failures,
                    );
                }
            }
        }
        LocalOutcome::Error(e) => {
            warn!(
                "transient failure delivering to uid {}: {}",
                target.uid, e
            );
            requeue_local(
                delivery,
                target,
                sender_addr,
                summary,
                message,
                failures,
            );
        }
    }
}

/// Park a local delivery in the local queue for the worker to retry.
fn requeue_local(
    delivery: &Delivery,
    target: &LocalTarget,
    sender_addr: &str,
    summary: &Summary,
    message: &[u8],
    failures: &mut Vec<(String, String)>,
) {
    let control = ControlFile {
        sender: sender_addr.to_owned(),
        summary: summary.clone(),
        recips: ControlRecips::Peer(vec![PeerRecip {
            uid: target.uid,
            filesystem: String::new(),
            resolved_at: chrono::Utc::now(),
            name: target.name.clone(),
            flags: target.flags,
        }]),
    };
    if let Err(e) = delivery.spool_to(Dest::Local, &control, message) {
        warn!("can't requeue local delivery: {}", e);
        failures.push((
            target.name.clone(),
            "the mail spool is unavailable".to_owned(),
        ));
    }
}
