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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Packmule.
///
/// This is stored in a file named `packmule.toml` under the Packmule system
/// root, which is typically `/usr/local/etc/packmule` or `/etc/packmule`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Identity of this server within the peer group.
    pub server: ServerConfig,

    /// Options relating to operational security of Packmule.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Where mailboxes and the spool live.
    pub storage: StorageConfig,

    /// The other mail servers in the peer group. Order is significant only in
    /// that it defines the queue indices; adding or removing peers requires a
    /// restart.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// How outgoing Internet mail leaves the system.
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Retry and loop-detection tuning. The defaults are reasonable for most
    /// installations.
    #[serde(default)]
    pub queue: QueueTuning,

    /// Static name-resolution table used when no external directory service
    /// is wired in.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The name under which this server is registered in the directory
    /// service. Mail whose recipients resolve to this name is delivered
    /// locally; everything else is queued.
    pub name: String,

    /// Address bounces are sent from, and the one address bounces are never
    /// sent *to*.
    pub postmaster: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// If true, chroot into the storage root before serving.
    ///
    /// This option must be disabled if the filesystem roots are symlinks to
    /// other locations.
    #[serde(default)]
    pub chroot_system: bool,
    /// If non-empty, set the process UID to this value after initialisation
    /// but before serving. The name must refer to a non-root user.
    #[serde(default)]
    pub system_user: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct StorageConfig {
    /// The local disk volumes available to hold mailboxes. A new mailbox is
    /// placed on whichever has the most free space, and the choice is
    /// recorded in the directory service before first use.
    pub filesystems: Vec<PathBuf>,

    /// Root of the spool area. Must be a single filesystem, since queued
    /// message data is hard-linked between its subdirectories.
    pub spool: PathBuf,
}

impl StorageConfig {
    /// The name under which a filesystem is recorded in the directory
    /// service and in control files: the final component of its root.
    pub fn fs_name(&self, index: usize) -> String {
        self.filesystems
            .get(index)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(|n| n.to_owned())
            .unwrap_or_else(|| format!("fs{}", index))
    }

    pub fn fs_index(&self, name: &str) -> Option<usize> {
        (0..self.filesystems.len()).find(|&ix| self.fs_name(ix) == name)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct PeerConfig {
    /// The peer's name as known to the directory service. Also names its
    /// spool subdirectory, so it must be a safe file name.
    pub name: String,

    /// Host to connect to when draining this peer's queue.
    pub host: String,

    /// External command which performs one message transfer. It is invoked
    /// with the host and the data file path as arguments, receives the
    /// control file on stdin, and reports the outcome through its
    /// `sysexits.h` exit code: 0 = accepted, EX_TEMPFAIL = try again later,
    /// anything else = permanently rejected.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SmtpConfig {
    /// If true, hand outgoing Internet mail straight to `mta_command`
    /// in-process instead of spooling it to the SMTP queue.
    pub use_local_mta: bool,

    /// Sendmail-compatible command used to submit one Internet message. The
    /// sender and recipient addresses are appended as arguments and the
    /// message is piped to stdin.
    pub mta_command: Vec<String>,
}

impl SmtpConfig {
    pub fn mta_command_or_default(&self) -> Vec<String> {
        if self.mta_command.is_empty() {
            vec!["/usr/sbin/sendmail".to_owned(), "-i".to_owned()]
        } else {
            self.mta_command.clone()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueTuning {
    /// First retry delay after a transient transfer failure, in seconds.
    pub retry_initial_secs: u64,

    /// Ceiling on the doubling retry delay, in seconds.
    pub retry_ceiling_secs: u64,

    /// Age, in hours, past which a spooled recipient's cached routing
    /// information is re-resolved before local delivery.
    pub resolve_max_age_hours: i64,

    /// Allowance, in minutes, for clock skew between this host and the
    /// directory service when comparing resolution and relocation times.
    pub clock_skew_mins: i64,

    /// Maximum number of transport hop lines a message may carry before it
    /// is treated as a forwarding loop and bounced.
    pub max_hops: usize,
}

impl Default for QueueTuning {
    fn default() -> Self {
        QueueTuning {
            retry_initial_secs: 60,
            retry_ceiling_secs: 960,
            resolve_max_age_hours: 24,
            clock_skew_mins: 5,
            max_hops: 8,
        }
    }
}

/// One entry of the built-in static directory.
///
/// Real installations normally point at an external directory service; the
/// static table exists for standalone use and tests.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct UserEntry {
    pub name: String,
    pub uid: i64,
    /// Server hosting the mailbox. Defaults to this server.
    #[serde(default)]
    pub server: String,
    /// Filesystem name on that server, if already assigned.
    #[serde(default)]
    pub filesystem: String,
}
