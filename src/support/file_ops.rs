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

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::{rngs::OsRng, Rng};

/// Write `data` into the file at `path`, atomically.
///
/// The file will first be staged within `tmp`, which must be on the same
/// filesystem as `path`.
///
/// If `overwrite` is true, this will replace anything already at `path`. If
/// false, the call will fail if `path` already exists.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    overwrite: bool,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    tf.as_file_mut().sync_all()?;
    if overwrite {
        tf.persist(path)?;
    } else {
        tf.persist_noclobber(path)?;
    }
    Ok(())
}

/// Fsync the directory itself.
///
/// The control-before-data invariant of the spool requires the control file's
/// directory entry to be durable before the data file is linked in.
pub fn sync_dir(dir: impl AsRef<Path>) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Move `target` into the directory `bad`, under a name derived from its
/// current one, for later forensic inspection.
///
/// Returns the path the file now lives at.
pub fn quarantine(
    target: impl AsRef<Path>,
    bad: impl AsRef<Path>,
) -> io::Result<PathBuf> {
    let target = target.as_ref();
    let bad = bad.as_ref();
    fs::create_dir_all(bad)?;

    let base = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_owned();

    loop {
        let dst = bad.join(format!("{}.{:08x}", base, OsRng.gen::<u32>()));
        // A rename would silently clobber a same-named file quarantined
        // earlier, so probe first and retry on collision.
        if dst.exists() {
            continue;
        }

        match fs::rename(target, &dst) {
            Ok(()) => return Ok(dst),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) => return Err(e),
        }
    }
}

pub trait IgnoreKinds {
    fn ignore_already_exists(self) -> Self;
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_already_exists(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                Ok(R::default())
            }
            Err(e) => Err(e),
        }
    }

    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spit_then_read_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out");

        spit(tmp.path(), &path, false, b"hello").unwrap();
        assert_eq!(b"hello" as &[u8], &fs::read(&path).unwrap() as &[u8]);

        assert!(spit(tmp.path(), &path, false, b"again").is_err());
        spit(tmp.path(), &path, true, b"again").unwrap();
        assert_eq!(b"again" as &[u8], &fs::read(&path).unwrap() as &[u8]);
    }

    #[test]
    fn quarantine_moves_and_preserves() {
        let tmp = tempfile::TempDir::new().unwrap();
        let victim = tmp.path().join("42C");
        fs::write(&victim, b"corrupt").unwrap();

        let dst = quarantine(&victim, tmp.path().join("bad")).unwrap();
        assert!(!victim.exists());
        assert_eq!(b"corrupt" as &[u8], &fs::read(&dst).unwrap() as &[u8]);
        assert!(dst
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("42C."));
    }
}
