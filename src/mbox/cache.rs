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

//! The process-wide mailbox cache.
//!
//! Exactly one in-memory `Mbox` exists per uid. Lookups go through a fixed
//! array of hash buckets; the bucket lock guards the uid table and the
//! attach counts, and each entry carries its own lock over the box state.
//!
//! Lock order, which must never be reversed: bucket lock, then box lock,
//! then any queue lock. `find` takes the bucket lock, bumps the attach
//! count, *releases the bucket*, and only then takes the box lock for
//! first-attach setup. No lock is ever held across I/O except a box's own.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info};

use crate::dnd::Directory;
use crate::mbox::mailbox::Mbox;
use crate::mbox::model::Uid;
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

const BUCKETS: usize = 64;

/// Number of consecutive idle flush passes after which an unattached box's
/// sub-structures are discarded.
pub const IDLE_EVICT_PASSES: u32 = 3;

pub struct MboxEntry {
    uid: Uid,
    /// Number of callers currently holding a `BoxRef`. Adjusted only while
    /// the owning bucket's lock is held.
    attach: AtomicU32,
    state: Mutex<Mbox>,
}

impl MboxEntry {
    fn new(uid: Uid, fs_hint: Option<usize>) -> Self {
        MboxEntry {
            uid,
            attach: AtomicU32::new(0),
            state: Mutex::new(Mbox::new(uid, fs_hint)),
        }
    }
}

pub struct MboxCache {
    buckets: Vec<Mutex<HashMap<i64, Arc<MboxEntry>>>>,
    config: Arc<SystemConfig>,
    directory: Arc<dyn Directory>,
    /// Well-known boxes (e.g. the postmaster's) exempt from eviction.
    protected: Mutex<HashSet<i64>>,
}

/// A live reference to a cached mailbox.
///
/// Holding a `BoxRef` pins the cache entry; dropping it releases the pin.
/// The box state itself is reached through `lock()`, and the guard must not
/// be held across a call that takes a bucket lock (such as another `find`).
pub struct BoxRef {
    cache: Arc<MboxCache>,
    entry: Arc<MboxEntry>,
}

impl BoxRef {
    pub fn uid(&self) -> Uid {
        self.entry.uid
    }

    pub fn lock(&self) -> MutexGuard<'_, Mbox> {
        self.entry.state.lock().unwrap()
    }

    /// Whether two references point at the same cache entry.
    pub fn same_box(&self, other: &BoxRef) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Drop for BoxRef {
    fn drop(&mut self) {
        self.cache.release_entry(&self.entry);
    }
}

impl MboxCache {
    pub fn new(
        config: Arc<SystemConfig>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        Arc::new(MboxCache {
            buckets: (0..BUCKETS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            config,
            directory,
            protected: Mutex::new(HashSet::new()),
        })
    }

    fn bucket(&self, uid: Uid) -> &Mutex<HashMap<i64, Arc<MboxEntry>>> {
        &self.buckets[uid.0.rem_euclid(BUCKETS as i64) as usize]
    }

    /// Exempt a uid from eviction.
    pub fn protect(&self, uid: Uid) {
        self.protected.lock().unwrap().insert(uid.0);
    }

    /// Look up (creating if necessary) the cached mailbox for `uid` and
    /// return a pinned reference to it.
    ///
    /// On the first attach of a cache lifetime this chooses a disk for the
    /// box if it has none, scans its folders, and runs the one-time
    /// consistency check. `no_record` skips recording the disk choice in
    /// the directory service, for callers deliberately stalling a box
    /// mid-transfer.
    pub fn find(
        self: &Arc<Self>,
        uid: Uid,
        fs_hint: Option<usize>,
        no_record: bool,
    ) -> Result<BoxRef, Error> {
        assert!(!uid.is_pseudo(), "find() on pseudo-uid {}", uid);

        let entry = {
            let mut bucket = self.bucket(uid).lock().unwrap();
            let entry = bucket
                .entry(uid.0)
                .or_insert_with(|| Arc::new(MboxEntry::new(uid, fs_hint)))
                .clone();
            entry.attach.fetch_add(1, SeqCst);
            entry
        };

        // Bucket lock released; now safe to take the box's own lock.
        if let Err(e) = self.first_attach_setup(&entry, no_record) {
            self.release_entry(&entry);
            return Err(e);
        }

        Ok(BoxRef {
            cache: Arc::clone(self),
            entry,
        })
    }

    fn first_attach_setup(
        &self,
        entry: &Arc<MboxEntry>,
        no_record: bool,
    ) -> Result<(), Error> {
        let mut state = entry.state.lock().unwrap();

        if !state.assigned() {
            let fs = match state.fs() {
                Some(fs) => fs,
                None => {
                    let fs = choose_filesystem(&self.config)?;
                    info!(
                        "box {}: assigned to filesystem {}",
                        entry.uid,
                        self.config.storage.fs_name(fs)
                    );
                    fs
                }
            };

            let root = self
                .config
                .storage
                .filesystems
                .get(fs)
                .ok_or(Error::NoFilesystemAvailable)?
                .clone();
            state.assign(fs, &root)?;

            if !no_record {
                self.directory.record_fs_choice(
                    entry.uid,
                    &self.config.server.name,
                    &self.config.storage.fs_name(fs),
                )?;
            }
        }

        if !state.checked() {
            state.consistency_check();
        }

        state.idle_ticks = 0;
        Ok(())
    }

    /// Drop one pin on an entry. Fatal if the count would go negative; that
    /// bookkeeping is load-bearing for eviction correctness.
    fn release_entry(&self, entry: &Arc<MboxEntry>) {
        let _bucket = self.bucket(entry.uid).lock().unwrap();
        let prev = entry.attach.fetch_sub(1, SeqCst);
        assert!(
            prev > 0,
            "mailbox attach count underflow (uid {})",
            entry.uid
        );
    }

    /// One full flush+evict pass over the cache.
    ///
    /// Each bucket is snapshotted under its lock with every entry pinned,
    /// then worked unlocked, so one slow box cannot stall lookups. Dirty
    /// state is always written out; sub-structures are discarded only for
    /// boxes that are otherwise unattached, unprotected, and idle for
    /// `IDLE_EVICT_PASSES` consecutive passes (or immediately when
    /// `free_idle`). Records marked `gone` are destroyed once unattached
    /// and not mid-transfer.
    pub fn flush_all(&self, free_idle: bool) {
        for bucket in &self.buckets {
            let pinned: Vec<Arc<MboxEntry>> = {
                let bucket = bucket.lock().unwrap();
                bucket
                    .values()
                    .map(|e| {
                        e.attach.fetch_add(1, SeqCst);
                        Arc::clone(e)
                    })
                    .collect()
            };

            for entry in &pinned {
                let mut state = entry.state.lock().unwrap();

                if let Err(e) = state.flush() {
                    error!("box {}: flush failed: {}", entry.uid, e);
                }

                // "Sole holder" counts our own pin.
                let sole = 1 == entry.attach.load(SeqCst);
                let protected =
                    self.protected.lock().unwrap().contains(&entry.uid.0);

                if sole && !protected {
                    state.idle_ticks += 1;
                    if (free_idle || state.idle_ticks >= IDLE_EVICT_PASSES)
                        && !state.dirty()
                    {
                        state.evict_substructures();
                    }
                } else {
                    state.idle_ticks = 0;
                }
            }

            let mut bucket = bucket.lock().unwrap();
            for entry in pinned {
                let prev = entry.attach.fetch_sub(1, SeqCst);
                assert!(
                    prev > 0,
                    "mailbox attach count underflow (uid {})",
                    entry.uid
                );
                if 1 == prev {
                    // Bucket-then-box is the documented order; these are
                    // flag reads only, no I/O under the bucket lock.
                    let state = entry.state.lock().unwrap();
                    if state.gone && !state.xfering {
                        info!("box {}: destroying gone record", entry.uid);
                        drop(state);
                        bucket.remove(&entry.uid.0);
                    }
                }
            }
        }
    }

    /// Whether a record for `uid` currently exists in the cache.
    pub fn resident(&self, uid: Uid) -> bool {
        self.bucket(uid).lock().unwrap().contains_key(&uid.0)
    }
}

/// Pick the configured filesystem with the most free space.
fn choose_filesystem(config: &SystemConfig) -> Result<usize, Error> {
    let mut best: Option<(usize, u64)> = None;

    for (ix, root) in config.storage.filesystems.iter().enumerate() {
        match nix::sys::statvfs::statvfs(root) {
            Ok(vfs) => {
                let free = vfs.blocks_available() as u64
                    * vfs.fragment_size() as u64;
                if best.map(|(_, b)| free > b).unwrap_or(true) {
                    best = Some((ix, free));
                }
            }
            Err(e) => {
                error!("statvfs {}: {}", root.display(), e);
            }
        }
    }

    best.map(|(ix, _)| ix).ok_or(Error::NoFilesystemAvailable)
}
