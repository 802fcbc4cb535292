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

//! On-disk spool layout.
//!
//! The spool root contains one directory per destination, a shared `tmp`
//! staging directory, and a `bad` directory for quarantined files. A queue
//! entry is a pair of files in the destination directory: `<qid>C` (the
//! control file) and `<qid>` (the message data, usually a hard link to a
//! canonical copy staged under `tmp`). The control file is made durable
//! before the data link appears, so any data file found on disk has a
//! readable control file describing it.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::queue::control::ControlFile;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

const TMP_DIR: &str = "tmp";
const BAD_DIR: &str = "bad";

/// Suffix distinguishing control files from data files.
const CONTROL_SUFFIX: char = 'C';

pub struct Spool {
    root: PathBuf,
}

/// Result of scanning one destination directory at startup.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovered {
    /// Complete entries, ascending by queue id.
    pub entries: Vec<u64>,
    /// Largest queue id seen anywhere in the directory, including
    /// quarantined strays.
    pub max_qid: u64,
}

impl Spool {
    pub fn new(root: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&root)?;
        fs::create_dir(root.join(TMP_DIR)).ignore_already_exists()?;
        fs::create_dir(root.join(BAD_DIR)).ignore_already_exists()?;
        Ok(Spool { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory, on the same filesystem as every destination.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub fn bad_dir(&self) -> PathBuf {
        self.root.join(BAD_DIR)
    }

    pub fn dest_dir(&self, dest: &str) -> PathBuf {
        self.root.join(dest)
    }

    pub fn ensure_dest(&self, dest: &str) -> Result<(), Error> {
        fs::create_dir(self.dest_dir(dest)).ignore_already_exists()?;
        Ok(())
    }

    pub fn data_path(&self, dest: &str, qid: u64) -> PathBuf {
        self.dest_dir(dest).join(qid.to_string())
    }

    pub fn control_path(&self, dest: &str, qid: u64) -> PathBuf {
        self.dest_dir(dest).join(format!("{}{}", qid, CONTROL_SUFFIX))
    }

    /// Write the control file for a new entry.
    ///
    /// This is the commit point of enqueueing: once this returns, recovery
    /// will either see the complete entry or quarantine the control file as
    /// a stray, but never see data without a description.
    pub fn commit_control(
        &self,
        dest: &str,
        qid: u64,
        control: &ControlFile,
    ) -> Result<(), Error> {
        control.write(&self.tmp_dir(), &self.control_path(dest, qid), false)?;
        file_ops::sync_dir(&self.dest_dir(dest))?;
        Ok(())
    }

    /// Rewrite an existing entry's control file in place.
    ///
    /// Used after a partial transfer to drop the recipients that were
    /// accepted. The queue id does not change.
    pub fn rewrite_control(
        &self,
        dest: &str,
        qid: u64,
        control: &ControlFile,
    ) -> Result<(), Error> {
        control.write(&self.tmp_dir(), &self.control_path(dest, qid), true)
    }

    /// Hard-link the canonical message data into the entry, completing it.
    ///
    /// Must be called after `commit_control` for the same entry.
    pub fn link_data(
        &self,
        dest: &str,
        qid: u64,
        canonical: &Path,
    ) -> Result<(), Error> {
        fs::hard_link(canonical, self.data_path(dest, qid))
            .ignore_already_exists()?;
        file_ops::sync_dir(&self.dest_dir(dest))?;
        Ok(())
    }

    /// Remove a fully-processed entry, control file last.
    pub fn remove(&self, dest: &str, qid: u64) -> Result<(), Error> {
        fs::remove_file(self.data_path(dest, qid)).ignore_not_found()?;
        fs::remove_file(self.control_path(dest, qid)).ignore_not_found()?;
        Ok(())
    }

    /// Move both files of a structurally bad entry to the `bad` directory.
    pub fn quarantine(&self, dest: &str, qid: u64) -> Result<(), Error> {
        let bad = self.bad_dir();
        for path in
            &[self.control_path(dest, qid), self.data_path(dest, qid)]
        {
            if path.exists() {
                let moved = file_ops::quarantine(path, &bad)?;
                warn!(
                    "{}: quarantined {} as {}",
                    dest,
                    path.display(),
                    moved.display()
                );
            }
        }
        Ok(())
    }

    /// Scan one destination directory after a restart.
    ///
    /// Entries with both files present are returned in ascending qid order.
    /// Files without a partner, and files whose names do not parse, are
    /// moved to the `bad` directory for an operator to inspect.
    pub fn recover(&self, dest: &str) -> Result<Recovered, Error> {
        let dir = self.dest_dir(dest);
        let mut controls = Vec::new();
        let mut datas = Vec::new();
        let mut strays = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            // Dotfiles are in-flight staging temporaries.
            if name.starts_with('.') {
                continue;
            }

            match parse_entry_name(&name) {
                Some((qid, true)) => controls.push(qid),
                Some((qid, false)) => datas.push(qid),
                None => strays.push(entry.path()),
            }
        }

        let bad = self.bad_dir();
        for path in strays {
            let moved = file_ops::quarantine(&path, &bad)?;
            warn!(
                "{}: unrecognized spool file {} moved to {}",
                dest,
                path.display(),
                moved.display()
            );
        }

        controls.sort_unstable();
        datas.sort_unstable();

        let max_qid = controls
            .last()
            .copied()
            .unwrap_or(0)
            .max(datas.last().copied().unwrap_or(0));

        let mut entries = Vec::new();
        for &qid in &controls {
            if datas.binary_search(&qid).is_ok() {
                entries.push(qid);
            } else {
                self.quarantine(dest, qid)?;
            }
        }
        for &qid in &datas {
            if controls.binary_search(&qid).is_err() {
                self.quarantine(dest, qid)?;
            }
        }

        if !entries.is_empty() {
            info!("{}: recovered {} queued message(s)", dest, entries.len());
        }

        Ok(Recovered { entries, max_qid })
    }

    /// Ids of complete entries currently on disk, ascending. Read-only;
    /// used by the queue inspection command.
    pub fn list(&self, dest: &str) -> Result<Vec<u64>, Error> {
        let mut controls = Vec::new();
        let mut datas = Vec::new();
        for entry in fs::read_dir(self.dest_dir(dest))? {
            let name = entry?.file_name();
            match parse_entry_name(&name.to_string_lossy()) {
                Some((qid, true)) => controls.push(qid),
                Some((qid, false)) => datas.push(qid),
                None => (),
            }
        }
        datas.sort_unstable();
        let mut entries: Vec<u64> = controls
            .into_iter()
            .filter(|qid| datas.binary_search(qid).is_ok())
            .collect();
        entries.sort_unstable();
        Ok(entries)
    }
}

/// `Some((qid, is_control))` if the name conforms to the spool convention.
fn parse_entry_name(name: &str) -> Option<(u64, bool)> {
    if name == TMP_DIR || name == BAD_DIR {
        return None;
    }

    let (digits, control) = match name.strip_suffix(CONTROL_SUFFIX) {
        Some(digits) => (digits, true),
        None => (name, false),
    };
    digits.parse::<u64>().ok().map(|qid| (qid, control))
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::prelude::*;

    use crate::mbox::model::{MessageId, Summary, SummaryFlags};
    use crate::queue::control::{ControlKind, ControlRecips};

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
            recips: ControlRecips::Smtp(vec!["b@example.org".to_owned()]),
        }
    }

    fn complete_entry(spool: &Spool, dest: &str, qid: u64) {
        let canonical = spool.tmp_dir().join(format!("m{}", qid));
        fs::write(&canonical, b"data").unwrap();
        spool.commit_control(dest, qid, &control()).unwrap();
        spool.link_data(dest, qid, &canonical).unwrap();
        fs::remove_file(&canonical).unwrap();
    }

    #[test]
    fn recovery_pairs_complete_entries_in_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("spool")).unwrap();
        spool.ensure_dest("smtp").unwrap();

        for &qid in &[9, 3, 17] {
            complete_entry(&spool, "smtp", qid);
        }

        let rec = spool.recover("smtp").unwrap();
        assert_eq!(vec![3, 9, 17], rec.entries);
        assert_eq!(17, rec.max_qid);
    }

    #[test]
    fn recovery_quarantines_strays() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("spool")).unwrap();
        spool.ensure_dest("smtp").unwrap();

        complete_entry(&spool, "smtp", 4);
        // control without data
        spool.commit_control("smtp", 5, &control()).unwrap();
        // data without control
        fs::write(spool.data_path("smtp", 6), b"orphan").unwrap();
        // garbage name
        fs::write(spool.dest_dir("smtp").join("core"), b"x").unwrap();

        let rec = spool.recover("smtp").unwrap();
        assert_eq!(vec![4], rec.entries);
        assert_eq!(6, rec.max_qid);

        assert!(!spool.control_path("smtp", 5).exists());
        assert!(!spool.data_path("smtp", 6).exists());
        assert!(!spool.dest_dir("smtp").join("core").exists());
        assert_eq!(3, fs::read_dir(spool.bad_dir()).unwrap().count());
    }

    #[test]
    fn recovery_skips_staging_dotfiles() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("spool")).unwrap();
        spool.ensure_dest("local").unwrap();

        fs::write(spool.dest_dir("local").join(".tmpXYZ"), b"half").unwrap();
        let rec = spool.recover("local").unwrap();
        assert!(rec.entries.is_empty());
        assert!(spool.dest_dir("local").join(".tmpXYZ").exists());
    }

    #[test]
    fn rewrite_control_keeps_entry_complete() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("spool")).unwrap();
        spool.ensure_dest("smtp").unwrap();
        complete_entry(&spool, "smtp", 2);

        let mut c = control();
        c.recips = ControlRecips::Smtp(vec!["c@example.org".to_owned()]);
        spool.rewrite_control("smtp", 2, &c).unwrap();

        assert_eq!(
            c,
            ControlFile::read(&spool.control_path("smtp", 2), ControlKind::Smtp)
                .unwrap()
        );
        assert_eq!(vec![2], spool.list("smtp").unwrap());
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let spool = Spool::new(tmp.path().join("spool")).unwrap();
        spool.ensure_dest("smtp").unwrap();
        complete_entry(&spool, "smtp", 1);

        spool.remove("smtp", 1).unwrap();
        spool.remove("smtp", 1).unwrap();
        assert!(spool.list("smtp").unwrap().is_empty());
    }
}
