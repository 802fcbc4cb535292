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

//! In-memory representation of one user's mailbox and its on-disk form.
//!
//! On disk, a mailbox is the directory `<fsroot>/<uid>/` containing:
//!
//! - `folders`: the folder table, one `number,length,name` line per folder.
//!   `length` is the cached total byte length of the folder's messages.
//! - `f<N>.sum`: packed summary lines for folder `N`.
//! - `prefs`: `key,value` preference lines.
//! - `lists`: `name,member,member,...` private mailing lists.
//! - `msg/<message-id>`: message data, shared between folders by id.
//! - `vacation.log`: addresses already auto-replied to, one per line.
//! - `tmp/`: staging area for atomic writes.
//!
//! All mutation happens under the owning cache entry's lock; nothing here
//! does its own locking. Writers set dirty flags; `flush` is the only path
//! that writes the tables back to disk.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{error, warn};

use crate::mbox::model::*;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// A named subdivision of a mailbox.
#[derive(Debug)]
pub struct Folder {
    pub number: u32,
    pub name: String,
    /// Lazily loaded; `None` means "not in memory", not "empty".
    summaries: Option<Vec<Summary>>,
    dirty: bool,
    /// Cached sum of the sizes of the folder's messages.
    total_len: u64,
}

impl Folder {
    fn new(number: u32, name: String) -> Self {
        Folder {
            number,
            name,
            summaries: Some(Vec::new()),
            dirty: false,
            total_len: 0,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    fn summary_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("f{}.sum", self.number))
    }
}

#[derive(Debug)]
pub struct Mbox {
    uid: Uid,
    /// Index into the configured filesystem roots; `None` until a disk has
    /// been chosen.
    fs: Option<usize>,
    path: Option<PathBuf>,
    /// Indexed by folder number. `None` slots are holes left by removed
    /// folders; the slot is retained so other folders keep their numbers.
    folders: Vec<Option<Folder>>,
    folders_dirty: bool,
    prefs: Option<HashMap<String, String>>,
    prefs_dirty: bool,
    lists: Option<HashMap<String, Vec<String>>>,
    lists_dirty: bool,
    /// The box no longer belongs on this server (transferred or removed).
    pub gone: bool,
    /// A transfer is in progress; mutually exclusive with new deliveries and
    /// with other transfers.
    pub xfering: bool,
    checked: bool,
    /// Consecutive flush passes for which this box was idle.
    pub(super) idle_ticks: u32,
}

impl Mbox {
    pub fn new(uid: Uid, fs_hint: Option<usize>) -> Self {
        Mbox {
            uid,
            fs: fs_hint,
            path: None,
            folders: Vec::new(),
            folders_dirty: false,
            prefs: None,
            prefs_dirty: false,
            lists: None,
            lists_dirty: false,
            gone: false,
            xfering: false,
            checked: false,
            idle_ticks: 0,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn fs(&self) -> Option<usize> {
        self.fs
    }

    pub fn assigned(&self) -> bool {
        self.path.is_some()
    }

    pub fn checked(&self) -> bool {
        self.checked
    }

    fn dir(&self) -> &Path {
        // The cache assigns a disk before handing out any reference; a
        // violation is a programming error on par with an attach-count
        // underflow.
        self.path.as_ref().expect("mailbox used before assignment")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir().join("tmp")
    }

    /// Bind this box to a disk and load (or create) its on-disk structure.
    ///
    /// Called exactly once per cache lifetime, by `MboxCache::find`, with
    /// the box lock held.
    pub fn assign(&mut self, fs: usize, fsroot: &Path) -> Result<(), Error> {
        let dir = fsroot.join(self.uid.to_string());
        fs::create_dir_all(dir.join("msg"))?;
        fs::create_dir_all(dir.join("tmp"))?;
        self.fs = Some(fs);
        self.path = Some(dir);
        self.load_folder_table();
        Ok(())
    }

    /// Discover the folders of this box from the folder table.
    ///
    /// I/O failure degrades to "no folders found" (plus the well-known set)
    /// rather than failing the whole cache.
    fn load_folder_table(&mut self) {
        let table = self.dir().join("folders");
        self.folders.clear();

        match fs::read_to_string(&table) {
            Ok(text) => {
                for line in text.lines() {
                    match parse_folder_line(line) {
                        Some((number, total_len, name)) => {
                            let slot = number as usize;
                            if self.folders.len() <= slot {
                                self.folders.resize_with(slot + 1, || None);
                            }
                            self.folders[slot] = Some(Folder {
                                number,
                                name,
                                summaries: None,
                                dirty: false,
                                total_len,
                            });
                        }
                        None => warn!(
                            "box {}: ignoring bad folder table line: {:?}",
                            self.uid, line
                        ),
                    }
                }
            }
            Err(ref e) if io::ErrorKind::NotFound == e.kind() => (),
            Err(e) => {
                error!(
                    "box {}: cannot read folder table, \
                     treating as empty: {}",
                    self.uid, e
                );
            }
        }

        for &(number, name) in &WELL_KNOWN_FOLDERS {
            let slot = number as usize;
            if self.folders.len() <= slot {
                self.folders.resize_with(slot + 1, || None);
            }
            if self.folders[slot].is_none() {
                self.folders[slot] = Some(Folder::new(number, name.to_owned()));
                self.folders_dirty = true;
            }
        }
    }

    pub fn folder(&self, number: u32) -> Result<&Folder, Error> {
        match self.folders.get(number as usize) {
            Some(Some(f)) => Ok(f),
            _ => Err(Error::NxFolder),
        }
    }

    fn folder_mut(&mut self, number: u32) -> Result<&mut Folder, Error> {
        match self.folders.get_mut(number as usize) {
            Some(Some(f)) => Ok(f),
            _ => Err(Error::NxFolder),
        }
    }

    /// Iterate over the extant folders, in number order.
    pub fn folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.iter().filter_map(|f| f.as_ref())
    }

    /// Load the folder's summaries if they are not in memory.
    fn ensure_summaries(&mut self, number: u32) -> Result<(), Error> {
        let dir = self.dir().to_owned();
        let folder = self.folder_mut(number)?;
        if folder.summaries.is_none() {
            let file = folder.summary_file(&dir);
            folder.summaries = Some(load_summaries(&file)?);
        }
        Ok(())
    }

    pub fn summaries(&mut self, number: u32) -> Result<&[Summary], Error> {
        self.ensure_summaries(number)?;
        Ok(self
            .folder(number)?
            .summaries
            .as_deref()
            .expect("summaries just loaded"))
    }

    pub fn contains_message(
        &mut self,
        number: u32,
        mid: MessageId,
    ) -> Result<bool, Error> {
        Ok(self
            .summaries(number)?
            .iter()
            .any(|s| s.message_id == mid))
    }

    /// Append a message to a folder.
    ///
    /// `Err(DuplicateMessage)` means the folder already holds this message
    /// id; callers on the delivery path treat that as an already-delivered,
    /// benign outcome.
    pub fn append_message(
        &mut self,
        number: u32,
        summary: Summary,
        data: &[u8],
    ) -> Result<(), Error> {
        if self.gone {
            return Err(Error::MailboxGone);
        }

        self.ensure_summaries(number)?;
        if self.contains_message(number, summary.message_id)? {
            return Err(Error::DuplicateMessage);
        }

        let msg_path = self.message_path(summary.message_id);
        let tmp = self.tmp_dir();
        // The same id may legitimately already have data here (a message
        // copied between folders shares its data file).
        file_ops::spit(&tmp, &msg_path, false, data)
            .ignore_already_exists()?;

        let folder = self.folder_mut(number)?;
        folder.total_len += summary.size;
        folder
            .summaries
            .as_mut()
            .expect("summaries just loaded")
            .push(summary);
        folder.dirty = true;
        self.folders_dirty = true;
        Ok(())
    }

    pub fn message_path(&self, mid: MessageId) -> PathBuf {
        self.dir().join("msg").join(mid.to_string())
    }

    pub fn read_message(&self, mid: MessageId) -> Result<Vec<u8>, Error> {
        match fs::read(self.message_path(mid)) {
            Ok(data) => Ok(data),
            Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
                Err(Error::NxMessage)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a user-defined folder, reusing the lowest hole at or above
    /// `FIRST_USER_FOLDER`.
    pub fn create_folder(&mut self, name: &str) -> Result<u32, Error> {
        if !crate::support::safe_name::is_safe_name(name) {
            return Err(Error::UnsafeName);
        }
        if self.folders().any(|f| f.name == name) {
            return Err(Error::FolderExists);
        }

        let slot = (FIRST_USER_FOLDER as usize..)
            .find(|&ix| {
                ix >= self.folders.len() || self.folders[ix].is_none()
            })
            .expect("unbounded range");
        if self.folders.len() <= slot {
            self.folders.resize_with(slot + 1, || None);
        }

        let number = slot as u32;
        self.folders[slot] = Some(Folder::new(number, name.to_owned()));
        self.folders_dirty = true;
        Ok(number)
    }

    /// Remove a user-defined folder, leaving a numbering hole.
    pub fn remove_folder(&mut self, number: u32) -> Result<(), Error> {
        if number < FIRST_USER_FOLDER {
            return Err(Error::NxFolder);
        }

        let dir = self.dir().to_owned();
        let folder = self.folder_mut(number)?;
        fs::remove_file(folder.summary_file(&dir)).ignore_not_found()?;
        self.folders[number as usize] = None;
        self.folders_dirty = true;
        Ok(())
    }

    fn ensure_prefs(&mut self) -> Result<(), Error> {
        if self.prefs.is_none() {
            self.prefs =
                Some(load_kv(&self.dir().join("prefs"), |v| {
                    unescape_field(v)
                })?);
        }
        Ok(())
    }

    pub fn pref(&mut self, key: &str) -> Result<Option<String>, Error> {
        self.ensure_prefs()?;
        Ok(self
            .prefs
            .as_ref()
            .expect("prefs just loaded")
            .get(key)
            .cloned())
    }

    pub fn set_pref(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        self.ensure_prefs()?;
        self.prefs
            .as_mut()
            .expect("prefs just loaded")
            .insert(key.into(), value.into());
        self.prefs_dirty = true;
        Ok(())
    }

    fn ensure_lists(&mut self) -> Result<(), Error> {
        if self.lists.is_none() {
            let raw = load_kv(&self.dir().join("lists"), |v| v.to_owned())?;
            self.lists = Some(
                raw.into_iter()
                    .map(|(name, members)| {
                        (
                            name,
                            members
                                .split(',')
                                .filter(|m| !m.is_empty())
                                .map(unescape_field)
                                .collect(),
                        )
                    })
                    .collect(),
            );
        }
        Ok(())
    }

    pub fn mailing_list(
        &mut self,
        name: &str,
    ) -> Result<Option<Vec<String>>, Error> {
        self.ensure_lists()?;
        Ok(self
            .lists
            .as_ref()
            .expect("lists just loaded")
            .get(name)
            .cloned())
    }

    pub fn set_mailing_list(
        &mut self,
        name: impl Into<String>,
        members: Vec<String>,
    ) -> Result<(), Error> {
        self.ensure_lists()?;
        self.lists
            .as_mut()
            .expect("lists just loaded")
            .insert(name.into(), members);
        self.lists_dirty = true;
        Ok(())
    }

    /// Whether any in-memory structure has unwritten changes.
    pub fn dirty(&self) -> bool {
        self.folders_dirty
            || self.prefs_dirty
            || self.lists_dirty
            || self.folders().any(|f| f.dirty)
    }

    /// Write every dirty structure back to disk.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.assigned() {
            return Ok(());
        }

        let dir = self.dir().to_owned();
        let tmp = self.tmp_dir();

        for slot in 0..self.folders.len() {
            let (file, text) = match self.folders[slot] {
                Some(ref f) if f.dirty => {
                    let mut text = String::new();
                    for summary in
                        f.summaries.as_ref().expect("dirty but not loaded")
                    {
                        text.push_str(&summary.encode());
                        text.push_str("\r\n");
                    }
                    (f.summary_file(&dir), text)
                }
                _ => continue,
            };
            file_ops::spit(&tmp, &file, true, text.as_bytes())?;
            if let Some(ref mut f) = self.folders[slot] {
                f.dirty = false;
            }
        }

        if self.folders_dirty {
            let mut text = String::new();
            for f in self.folders() {
                text.push_str(&format!(
                    "{},{},{}\r\n",
                    f.number,
                    f.total_len,
                    escape_field(&f.name)
                ));
            }
            file_ops::spit(&tmp, dir.join("folders"), true, text.as_bytes())?;
            self.folders_dirty = false;
        }

        if self.prefs_dirty {
            let mut text = String::new();
            for (k, v) in self.prefs.as_ref().expect("dirty but not loaded") {
                text.push_str(&format!(
                    "{},{}\r\n",
                    escape_field(k),
                    escape_field(v)
                ));
            }
            file_ops::spit(&tmp, dir.join("prefs"), true, text.as_bytes())?;
            self.prefs_dirty = false;
        }

        if self.lists_dirty {
            let mut text = String::new();
            for (name, members) in
                self.lists.as_ref().expect("dirty but not loaded")
            {
                text.push_str(&escape_field(name));
                for m in members {
                    text.push(',');
                    text.push_str(&escape_field(m));
                }
                text.push_str("\r\n");
            }
            file_ops::spit(&tmp, dir.join("lists"), true, text.as_bytes())?;
            self.lists_dirty = false;
        }

        Ok(())
    }

    /// Drop the lazily-loaded sub-structures.
    ///
    /// Caller must have flushed first; evicting dirty state would lose it,
    /// so that is refused.
    pub fn evict_substructures(&mut self) {
        if self.dirty() {
            warn!("box {}: refusing to evict dirty structures", self.uid);
            return;
        }

        for folder in self.folders.iter_mut().filter_map(|f| f.as_mut()) {
            folder.summaries = None;
        }
        self.prefs = None;
        self.lists = None;
    }

    /// One-time reconciliation of the folder table's recorded lengths
    /// against the actual summary contents.
    ///
    /// Runs once per cache lifetime of the box; repairs and logs any
    /// mismatch rather than failing.
    pub fn consistency_check(&mut self) {
        let uid = self.uid;
        let numbers: Vec<u32> = self.folders().map(|f| f.number).collect();

        for number in numbers {
            let actual = match self.summaries(number) {
                Ok(summaries) => {
                    summaries.iter().map(|s| s.size).sum::<u64>()
                }
                Err(e) => {
                    error!(
                        "box {}: cannot load folder {} for check: {}",
                        uid, number, e
                    );
                    continue;
                }
            };

            let folder =
                self.folder_mut(number).expect("folder vanished mid-check");
            if folder.total_len != actual {
                warn!(
                    "box {}: folder {} recorded length {} != actual {}, \
                     repairing",
                    uid, number, folder.total_len, actual
                );
                folder.total_len = actual;
                self.folders_dirty = true;
            }
        }

        self.checked = true;
    }

    /// Whether a folder's summaries are currently resident in memory.
    pub fn summaries_loaded(&self, number: u32) -> bool {
        matches!(
            self.folders.get(number as usize),
            Some(Some(Folder {
                summaries: Some(_),
                ..
            }))
        )
    }

    /// Whether `addr` has already received an autoreply during the life of
    /// the current vacation message.
    pub fn vacation_replied(&self, addr: &str) -> Result<bool, Error> {
        match fs::read_to_string(self.dir().join("vacation.log")) {
            Ok(text) => Ok(text.lines().any(|l| l == addr)),
            Err(ref e) if io::ErrorKind::NotFound == e.kind() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record_vacation_reply(&self, addr: &str) -> Result<(), Error> {
        use std::io::Write;

        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir().join("vacation.log"))?;
        writeln!(f, "{}", addr)?;
        Ok(())
    }

    /// Reset the autoreply suppression log, for when the user installs a new
    /// vacation message.
    pub fn clear_vacation_log(&self) -> Result<(), Error> {
        fs::remove_file(self.dir().join("vacation.log"))
            .ignore_not_found()?;
        Ok(())
    }
}

fn parse_folder_line(line: &str) -> Option<(u32, u64, String)> {
    let mut fields = line.splitn(3, ',');
    let number = fields.next()?.parse().ok()?;
    let total_len = fields.next()?.parse().ok()?;
    let name = unescape_field(fields.next()?);
    Some((number, total_len, name))
}

fn load_summaries(file: &Path) -> Result<Vec<Summary>, Error> {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e.into()),
    };

    let mut summaries = Vec::new();
    for line in text.lines() {
        match Summary::decode(line) {
            Ok(s) => summaries.push(s),
            Err(_) => warn!(
                "{}: skipping unparsable summary line: {:?}",
                file.display(),
                line
            ),
        }
    }
    Ok(summaries)
}

fn load_kv(
    file: &Path,
    map_value: impl Fn(&str) -> String,
) -> Result<HashMap<String, String>, Error> {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(HashMap::new())
        }
        Err(e) => return Err(e.into()),
    };

    Ok(text
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(2, ',');
            let key = unescape_field(fields.next()?);
            let value = fields.next()?;
            Some((key, map_value(value)))
        })
        .collect())
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::*;
    use crate::support::error::Error;

    fn summary(mid: u64, size: u64) -> Summary {
        Summary {
            message_id: MessageId(mid),
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            size,
            flags: SummaryFlags::UNREAD,
            sender: "alice".to_owned(),
            subject: "hi".to_owned(),
        }
    }

    fn fresh_box(root: &Path, uid: i64) -> Mbox {
        let mut mbox = Mbox::new(Uid(uid), None);
        mbox.assign(0, root).unwrap();
        mbox
    }

    #[test]
    fn well_known_folders_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mbox = fresh_box(tmp.path(), 100);

        let names: Vec<&str> =
            mbox.folders().map(|f| f.name.as_str()).collect();
        assert_eq!(vec!["Trash", "Audit", "Inbox"], names);
    }

    #[test]
    fn append_flush_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut mbox = fresh_box(tmp.path(), 100);
            mbox.append_message(FOLDER_INBOX, summary(1, 10), b"message one")
                .unwrap();
            mbox.append_message(FOLDER_INBOX, summary(2, 20), b"message two")
                .unwrap();
            mbox.flush().unwrap();
        }

        let mut mbox = fresh_box(tmp.path(), 100);
        let loaded = mbox.summaries(FOLDER_INBOX).unwrap();
        assert_eq!(2, loaded.len());
        assert_eq!(MessageId(1), loaded[0].message_id);
        assert_eq!(MessageId(2), loaded[1].message_id);
        assert_eq!(30, mbox.folder(FOLDER_INBOX).unwrap().total_len());
        assert_eq!(b"message one".to_vec(), mbox.read_message(MessageId(1)).unwrap());
    }

    #[test]
    fn duplicate_append_detected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut mbox = fresh_box(tmp.path(), 100);
        mbox.append_message(FOLDER_INBOX, summary(1, 10), b"data")
            .unwrap();
        assert_matches!(
            Err(Error::DuplicateMessage),
            mbox.append_message(FOLDER_INBOX, summary(1, 10), b"data")
        );
        assert_eq!(1, mbox.summaries(FOLDER_INBOX).unwrap().len());
    }

    #[test]
    fn folder_holes_preserve_numbering() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut mbox = fresh_box(tmp.path(), 100);

        let a = mbox.create_folder("alpha").unwrap();
        let b = mbox.create_folder("beta").unwrap();
        assert_eq!(FIRST_USER_FOLDER, a);
        assert_eq!(FIRST_USER_FOLDER + 1, b);

        mbox.remove_folder(a).unwrap();
        assert_matches!(Err(Error::NxFolder), mbox.folder(a));
        // beta keeps its number across the hole...
        assert_eq!("beta", mbox.folder(b).unwrap().name);
        // ...and a new folder reuses the hole
        assert_eq!(a, mbox.create_folder("gamma").unwrap());
    }

    #[test]
    fn eviction_refused_while_dirty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut mbox = fresh_box(tmp.path(), 100);
        mbox.append_message(FOLDER_INBOX, summary(1, 10), b"data")
            .unwrap();

        assert!(mbox.dirty());
        mbox.evict_substructures();
        // still there
        assert_eq!(1, mbox.summaries(FOLDER_INBOX).unwrap().len());

        mbox.flush().unwrap();
        mbox.evict_substructures();
        // reloaded transparently from disk
        assert_eq!(1, mbox.summaries(FOLDER_INBOX).unwrap().len());
    }

    #[test]
    fn consistency_check_repairs_lengths() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut mbox = fresh_box(tmp.path(), 100);
            mbox.append_message(FOLDER_INBOX, summary(1, 10), b"data")
                .unwrap();
            mbox.flush().unwrap();
        }

        // Tamper with the recorded length
        let table = tmp.path().join("100").join("folders");
        let tampered = fs::read_to_string(&table)
            .unwrap()
            .replace(&format!("{},10,", FOLDER_INBOX), &format!("{},999,", FOLDER_INBOX));
        fs::write(&table, tampered).unwrap();

        let mut mbox = fresh_box(tmp.path(), 100);
        assert_eq!(999, mbox.folder(FOLDER_INBOX).unwrap().total_len());
        mbox.consistency_check();
        assert_eq!(10, mbox.folder(FOLDER_INBOX).unwrap().total_len());
        assert!(mbox.checked());
    }

    #[test]
    fn prefs_and_lists_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut mbox = fresh_box(tmp.path(), 100);
            mbox.set_pref("forward-to", "bob").unwrap();
            mbox.set_pref("vacation", "gone fishing, back never").unwrap();
            mbox.set_mailing_list(
                "cabal",
                vec!["alice".to_owned(), "bob".to_owned()],
            )
            .unwrap();
            mbox.flush().unwrap();
        }

        let mut mbox = fresh_box(tmp.path(), 100);
        assert_eq!(Some("bob".to_owned()), mbox.pref("forward-to").unwrap());
        assert_eq!(
            Some("gone fishing, back never".to_owned()),
            mbox.pref("vacation").unwrap()
        );
        assert_eq!(None, mbox.pref("nonesuch").unwrap());
        assert_eq!(
            Some(vec!["alice".to_owned(), "bob".to_owned()]),
            mbox.mailing_list("cabal").unwrap()
        );
    }

    #[test]
    fn vacation_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mbox = fresh_box(tmp.path(), 100);

        assert!(!mbox.vacation_replied("carol@example.com").unwrap());
        mbox.record_vacation_reply("carol@example.com").unwrap();
        assert!(mbox.vacation_replied("carol@example.com").unwrap());
        assert!(!mbox.vacation_replied("dave@example.com").unwrap());

        mbox.clear_vacation_log().unwrap();
        assert!(!mbox.vacation_replied("carol@example.com").unwrap());
    }

    #[test]
    fn gone_box_refuses_delivery() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut mbox = fresh_box(tmp.path(), 100);
        mbox.gone = true;
        assert_matches!(
            Err(Error::MailboxGone),
            mbox.append_message(FOLDER_INBOX, summary(1, 10), b"data")
        );
    }
}
