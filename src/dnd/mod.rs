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

//! Interface to the directory/naming service.
//!
//! The wire client for the real directory service lives outside this crate;
//! everything here is the seam the core calls through, plus a static
//! config-table implementation for standalone operation and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::mbox::model::Uid;
use crate::support::error::Error;
use crate::support::system_config::{SystemConfig, UserEntry};

/// What the directory knows about one name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Resolved to a mailbox in the peer group. `filesystem` is empty until
    /// some server has durably chosen a disk for the box.
    Hosted {
        uid: Uid,
        server: String,
        filesystem: String,
    },
    /// The name matched more than one user.
    Ambiguous,
    /// No user by that name.
    NoSuchUser,
    /// The user exists but the sender may not send to them.
    NoSendPermission,
}

pub trait Directory: Send + Sync {
    /// Resolve a name to a uid and its routing information.
    ///
    /// `Err` means the directory service itself could not be consulted, not
    /// that the name failed to resolve.
    fn resolve(&self, name: &str) -> Result<Lookup, Error>;

    fn resolve_uid(&self, uid: Uid) -> Result<Lookup, Error>;

    /// All uids hosted on `server`. Broadcast deliveries expand through
    /// this.
    fn hosted_uids(&self, server: &str) -> Result<Vec<Uid>, Error>;

    /// Durably record which server and disk hold `uid`'s mailbox.
    ///
    /// Implementations retry until the record is acknowledged; a mailbox
    /// must not be used under a wrong recorded location.
    fn record_fs_choice(
        &self,
        uid: Uid,
        server: &str,
        filesystem: &str,
    ) -> Result<(), Error>;
}

/// Directory backed by the `[[users]]` table of the system configuration.
#[derive(Default)]
pub struct StaticDirectory {
    server: String,
    entries: Mutex<HashMap<String, UserEntry>>,
}

impl StaticDirectory {
    pub fn from_config(config: &SystemConfig) -> Self {
        let dir = StaticDirectory {
            server: config.server.name.clone(),
            entries: Mutex::new(HashMap::new()),
        };
        for entry in &config.users {
            dir.insert(entry.clone());
        }
        dir
    }

    pub fn insert(&self, mut entry: UserEntry) {
        if entry.server.is_empty() {
            entry.server = self.server.clone();
        }
        self.entries
            .lock()
            .unwrap()
            .insert(entry.name.clone(), entry);
    }

    fn lookup_of(&self, entry: &UserEntry) -> Lookup {
        Lookup::Hosted {
            uid: Uid(entry.uid),
            server: entry.server.clone(),
            filesystem: entry.filesystem.clone(),
        }
    }
}

impl Directory for StaticDirectory {
    fn resolve(&self, name: &str) -> Result<Lookup, Error> {
        let entries = self.entries.lock().unwrap();
        Ok(match entries.get(name) {
            Some(entry) => self.lookup_of(entry),
            None => Lookup::NoSuchUser,
        })
    }

    fn resolve_uid(&self, uid: Uid) -> Result<Lookup, Error> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .values()
            .find(|e| e.uid == uid.0)
            .map(|e| self.lookup_of(e))
            .unwrap_or(Lookup::NoSuchUser))
    }

    fn hosted_uids(&self, server: &str) -> Result<Vec<Uid>, Error> {
        let entries = self.entries.lock().unwrap();
        let mut uids: Vec<Uid> = entries
            .values()
            .filter(|e| e.server == server)
            .map(|e| Uid(e.uid))
            .collect();
        uids.sort();
        uids.dedup();
        Ok(uids)
    }

    fn record_fs_choice(
        &self,
        uid: Uid,
        server: &str,
        filesystem: &str,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.uid == uid.0 {
                entry.server = server.to_owned();
                entry.filesystem = filesystem.to_owned();
                return Ok(());
            }
        }
        // Uids that arrive by direct reference (not name resolution) still
        // get a record so later lookups route correctly.
        entries.insert(
            format!("uid-{}", uid),
            UserEntry {
                name: format!("uid-{}", uid),
                uid: uid.0,
                server: server.to_owned(),
                filesystem: filesystem.to_owned(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir() -> StaticDirectory {
        let d = StaticDirectory {
            server: "alpha".to_owned(),
            entries: Mutex::new(HashMap::new()),
        };
        d.insert(UserEntry {
            name: "alice".to_owned(),
            uid: 100,
            server: String::new(),
            filesystem: String::new(),
        });
        d.insert(UserEntry {
            name: "bob".to_owned(),
            uid: 101,
            server: "beta".to_owned(),
            filesystem: "fs0".to_owned(),
        });
        d
    }

    #[test]
    fn resolves_names_and_uids() {
        let d = dir();
        assert_eq!(
            Lookup::Hosted {
                uid: Uid(100),
                server: "alpha".to_owned(),
                filesystem: String::new(),
            },
            d.resolve("alice").unwrap()
        );
        assert_eq!(
            Lookup::Hosted {
                uid: Uid(101),
                server: "beta".to_owned(),
                filesystem: "fs0".to_owned(),
            },
            d.resolve_uid(Uid(101)).unwrap()
        );
        assert_eq!(Lookup::NoSuchUser, d.resolve("nonesuch").unwrap());
    }

    #[test]
    fn records_fs_choice() {
        let d = dir();
        d.record_fs_choice(Uid(100), "alpha", "fs1").unwrap();
        assert_eq!(
            Lookup::Hosted {
                uid: Uid(100),
                server: "alpha".to_owned(),
                filesystem: "fs1".to_owned(),
            },
            d.resolve("alice").unwrap()
        );
    }
}
