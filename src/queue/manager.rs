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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{Condvar, Mutex};

use log::info;

use crate::queue::spool::Spool;
use crate::support::error::Error;
use crate::support::safe_name::is_safe_name;
use crate::support::system_config::SystemConfig;

/// Destination directory name for mail addressed to this server.
pub const LOCAL_DEST: &str = "local";
/// Destination directory name for outgoing Internet mail.
pub const SMTP_DEST: &str = "smtp";

/// A delivery destination, identifying one queue and one worker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Dest {
    /// This server; drained by the local delivery worker.
    Local,
    /// The outside world, via SMTP.
    Internet,
    /// Peer server, by index into the configured peer table.
    Peer(usize),
}

impl Dest {
    fn index(self) -> usize {
        match self {
            Dest::Local => 0,
            Dest::Internet => 1,
            Dest::Peer(i) => 2 + i,
        }
    }
}

struct DestQueue {
    fifo: Mutex<VecDeque<u64>>,
    cond: Condvar,
}

impl DestQueue {
    fn new() -> Self {
        DestQueue {
            fifo: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }
}

/// The in-memory face of the spool: one strictly-FIFO queue per
/// destination, each drained by exactly one worker.
///
/// The manager owns ordering and wakeups only; entry contents live in the
/// spool and are the worker's business. An entry stays at the head of its
/// queue until the worker disposes of it, so a crash at any point leaves
/// the entry on disk for recovery.
pub struct QueueManager {
    spool: Spool,
    /// Destination directory names, index-aligned with `queues`.
    names: Vec<String>,
    queues: Vec<DestQueue>,
    next_qid: AtomicU64,
}

impl QueueManager {
    /// Open the spool, recover every destination directory, and seed the
    /// queue id counter to one past the largest id seen.
    pub fn new(config: &SystemConfig) -> Result<Self, Error> {
        let spool = Spool::new(config.storage.spool.clone())?;

        let mut names =
            vec![LOCAL_DEST.to_owned(), SMTP_DEST.to_owned()];
        for peer in &config.peers {
            if !is_safe_name(&peer.name) {
                return Err(Error::UnsafeName);
            }
            names.push(peer.name.clone());
        }

        let mut queues = Vec::with_capacity(names.len());
        let mut max_qid = 0u64;
        for name in &names {
            spool.ensure_dest(name)?;
            let recovered = spool.recover(name)?;
            max_qid = max_qid.max(recovered.max_qid);
            let q = DestQueue::new();
            q.fifo.lock().unwrap().extend(recovered.entries);
            queues.push(q);
        }

        info!("queue manager ready, next qid {}", max_qid + 1);

        Ok(QueueManager {
            spool,
            names,
            queues,
            next_qid: AtomicU64::new(max_qid + 1),
        })
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn dest_name(&self, dest: Dest) -> &str {
        &self.names[dest.index()]
    }

    pub fn dest_count(&self) -> usize {
        self.names.len()
    }

    /// Map a peer server name to its queue, or `None` if the server is not
    /// in the peer table.
    pub fn dest_of_server(&self, server: &str) -> Option<Dest> {
        self.names[2..]
            .iter()
            .position(|n| n == server)
            .map(Dest::Peer)
    }

    /// Allocate a queue id, unique across all destinations for the life of
    /// this spool.
    pub fn next_qid(&self) -> u64 {
        self.next_qid.fetch_add(1, SeqCst)
    }

    /// Make a spooled entry visible to its worker.
    pub fn enqueue(&self, dest: Dest, qid: u64) {
        let q = &self.queues[dest.index()];
        q.fifo.lock().unwrap().push_back(qid);
        q.cond.notify_one();
    }

    /// Block until the queue is non-empty and return the head entry
    /// without removing it. Only `pop_head` removes entries.
    pub fn peek_blocking(&self, dest: Dest) -> u64 {
        let q = &self.queues[dest.index()];
        let mut fifo = q.fifo.lock().unwrap();
        loop {
            match fifo.front() {
                Some(&qid) => return qid,
                None => fifo = q.cond.wait(fifo).unwrap(),
            }
        }
    }

    pub fn try_peek(&self, dest: Dest) -> Option<u64> {
        self.queues[dest.index()]
            .fifo
            .lock()
            .unwrap()
            .front()
            .copied()
    }

    /// Remove `qid` from the head of the queue.
    ///
    /// The caller must be the destination's worker and `qid` must be the
    /// entry it obtained from `peek_blocking`; anything else indicates two
    /// workers draining one queue.
    pub fn pop_head(&self, dest: Dest, qid: u64) {
        let mut fifo = self.queues[dest.index()].fifo.lock().unwrap();
        let head = fifo.pop_front();
        assert_eq!(
            Some(qid),
            head,
            "queue head changed under its worker ({})",
            self.dest_name(dest)
        );
    }

    pub fn len(&self, dest: Dest) -> usize {
        self.queues[dest.index()].fifo.lock().unwrap().len()
    }

    /// Snapshot of the queue contents, head first.
    pub fn snapshot(&self, dest: Dest) -> Vec<u64> {
        self.queues[dest.index()]
            .fifo
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::prelude::*;

    use crate::mbox::model::{MessageId, Summary, SummaryFlags};
    use crate::queue::control::{ControlFile, ControlRecips};
    use crate::support::system_config::PeerConfig;

    fn config(tmp: &tempfile::TempDir) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.server.name = "alpha".to_owned();
        config.storage.spool = tmp.path().join("spool");
        config.peers.push(PeerConfig {
            name: "beta".to_owned(),
            host: "beta.example.org".to_owned(),
            command: vec![],
        });
        config
    }

    fn control() -> ControlFile {
        ControlFile {
            sender: "alice".to_owned(),
            summary: Summary {
                message_id: MessageId(1),
                date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                size: 4,
                flags: SummaryFlags::empty(),
                sender: "alice".to_owned(),
                subject: "hi".to_owned(),
            },
            recips: ControlRecips::Smtp(vec!["x@example.org".to_owned()]),
        }
    }

    fn spool_entry(qm: &QueueManager, dest: Dest) -> u64 {
        let qid = qm.next_qid();
        let name = qm.dest_name(dest).to_owned();
        let canonical = qm.spool().tmp_dir().join(format!("m{}", qid));
        fs::write(&canonical, b"data").unwrap();
        qm.spool().commit_control(&name, qid, &control()).unwrap();
        qm.spool().link_data(&name, qid, &canonical).unwrap();
        fs::remove_file(&canonical).unwrap();
        qm.enqueue(dest, qid);
        qid
    }

    #[test]
    fn fifo_order_per_destination() {
        let tmp = tempfile::TempDir::new().unwrap();
        let qm = QueueManager::new(&config(&tmp)).unwrap();

        let a = spool_entry(&qm, Dest::Internet);
        let b = spool_entry(&qm, Dest::Internet);
        let c = spool_entry(&qm, Dest::Internet);
        // another destination does not interleave
        spool_entry(&qm, Dest::Peer(0));

        for &expected in &[a, b, c] {
            let qid = qm.peek_blocking(Dest::Internet);
            assert_eq!(expected, qid);
            qm.pop_head(Dest::Internet, qid);
        }
        assert_eq!(0, qm.len(Dest::Internet));
        assert_eq!(1, qm.len(Dest::Peer(0)));
    }

    #[test]
    fn peek_leaves_head_in_place() {
        let tmp = tempfile::TempDir::new().unwrap();
        let qm = QueueManager::new(&config(&tmp)).unwrap();
        let a = spool_entry(&qm, Dest::Local);
        assert_eq!(a, qm.peek_blocking(Dest::Local));
        assert_eq!(a, qm.peek_blocking(Dest::Local));
        assert_eq!(vec![a], qm.snapshot(Dest::Local));
    }

    #[test]
    fn restart_recovers_entries_and_reseeds_qids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(&tmp);

        let (a, b, max) = {
            let qm = QueueManager::new(&config).unwrap();
            let a = spool_entry(&qm, Dest::Peer(0));
            let b = spool_entry(&qm, Dest::Peer(0));
            (a, b, qm.next_qid.load(SeqCst))
        };

        let qm = QueueManager::new(&config).unwrap();
        assert_eq!(vec![a, b], qm.snapshot(Dest::Peer(0)));
        assert!(qm.next_qid() >= max.max(b + 1));
    }

    #[test]
    fn enqueue_wakes_blocked_worker() {
        let tmp = tempfile::TempDir::new().unwrap();
        let qm = Arc::new(QueueManager::new(&config(&tmp)).unwrap());

        let waiter = {
            let qm = Arc::clone(&qm);
            std::thread::spawn(move || qm.peek_blocking(Dest::Local))
        };

        std::thread::sleep(Duration::from_millis(50));
        let qid = spool_entry(&qm, Dest::Local);
        assert_eq!(qid, waiter.join().unwrap());
    }

    #[test]
    fn unsafe_peer_name_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.peers[0].name = "../escape".to_owned();
        match QueueManager::new(&config) {
            Err(Error::UnsafeName) => (),
            Ok(_) => panic!("unsafe peer name accepted"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    #[should_panic(expected = "queue head changed")]
    fn pop_of_non_head_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let qm = QueueManager::new(&config(&tmp)).unwrap();
        spool_entry(&qm, Dest::Local);
        qm.pop_head(Dest::Local, 999_999);
    }
}
