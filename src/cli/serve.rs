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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use nix::sys::signal;

use crate::deliver::Delivery;
use crate::dnd::{Directory, Lookup, StaticDirectory};
use crate::mbox::cache::MboxCache;
use crate::notify::{ChannelNotifier, LogNotifier, Notifier};
use crate::queue::manager::{Dest, QueueManager};
use crate::queue::worker;
use crate::support::system_config::SystemConfig;
use crate::support::unix_privileges;
use crate::xfer::{CommandPeerTransport, MtaSmtpTransport, SmtpTransport};

// Need to use this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

/// How often resident mailboxes are written back and idle ones evicted.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const TICK: Duration = Duration::from_secs(1);

static FLUSH_NOW: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: nix::libc::c_int) {
    FLUSH_NOW.store(true, SeqCst);
}

pub fn serve(mut system_config: SystemConfig, _system_root: PathBuf) {
    configure_system(&mut system_config);
    let config = Arc::new(system_config);

    let directory = Arc::new(StaticDirectory::from_config(&config));
    let cache = MboxCache::new(
        Arc::clone(&config),
        Arc::clone(&directory) as Arc<dyn Directory>,
    );

    // The postmaster box must stay resident so that bounces cannot stall
    // behind a cache miss.
    match directory.resolve(&config.server.postmaster) {
        Ok(Lookup::Hosted {
            uid, ref server, ..
        }) if *server == config.server.name => cache.protect(uid),
        _ => info!(
            "postmaster '{}' is not hosted here; bounces will be forwarded",
            config.server.postmaster
        ),
    }

    let queues = match QueueManager::new(&config) {
        Ok(qm) => Arc::new(qm),
        Err(e) => fatal!(
            EX_IOERR,
            "Unable to open the spool at '{}': {}",
            config.storage.spool.display(),
            e
        ),
    };

    let smtp: Arc<dyn SmtpTransport> =
        Arc::new(MtaSmtpTransport::new(config.smtp.clone()));
    let notifier = ChannelNotifier::spawn(Arc::new(LogNotifier));

    let delivery = match Delivery::new(
        Arc::clone(&config),
        Arc::clone(&cache),
        Arc::clone(&queues),
        Arc::clone(&directory) as Arc<dyn Directory>,
        notifier as Arc<dyn Notifier>,
        Arc::clone(&smtp),
    ) {
        Ok(d) => d,
        Err(e) => fatal!(
            EX_IOERR,
            "Unable to open the message-id allocator: {}",
            e
        ),
    };

    {
        let qm = Arc::clone(&queues);
        let d = Arc::clone(&delivery);
        thread::spawn(move || worker::run_local(qm, d));
    }
    {
        let qm = Arc::clone(&queues);
        let d = Arc::clone(&delivery);
        let smtp = Arc::clone(&smtp);
        thread::spawn(move || worker::run_smtp(qm, d, smtp));
    }
    for (ix, peer) in config.peers.iter().enumerate() {
        let qm = Arc::clone(&queues);
        let d = Arc::clone(&delivery);
        let peer = peer.clone();
        thread::spawn(move || {
            worker::run_peer(
                qm,
                d,
                Dest::Peer(ix),
                peer,
                Arc::new(CommandPeerTransport),
            )
        });
    }

    let action = signal::SigAction::new(
        signal::SigHandler::Handler(on_sigusr1),
        signal::SaFlags::SA_RESTART,
        signal::SigSet::empty(),
    );
    if let Err(e) =
        unsafe { signal::sigaction(signal::Signal::SIGUSR1, &action) }
    {
        fatal!(EX_OSERR, "Unable to install SIGUSR1 handler: {}", e);
    }

    info!(
        "{} serving: {} queue(s), {} disk volume(s)",
        config.server.name,
        queues.dest_count(),
        config.storage.filesystems.len()
    );

    // The main thread is the flusher. Both the SIGUSR1 flush and the
    // periodic one keep boxes resident; eviction happens once a box has
    // sat out enough consecutive passes.
    let mut since_flush = Duration::from_secs(0);
    loop {
        thread::sleep(TICK);
        since_flush += TICK;
        if FLUSH_NOW.swap(false, SeqCst) {
            info!("flushing all mailboxes on SIGUSR1");
            cache.flush_all(false);
            since_flush = Duration::from_secs(0);
        } else if since_flush >= FLUSH_INTERVAL {
            cache.flush_all(false);
            since_flush = Duration::from_secs(0);
        }
    }
}

/// Apply the configured chroot and privilege deescalation, rewriting the
/// storage paths to their post-chroot forms.
fn configure_system(config: &mut SystemConfig) {
    let mut root = if config.security.chroot_system {
        let mut paths: Vec<&Path> =
            config.storage.filesystems.iter().map(|p| &**p).collect();
        paths.push(&config.storage.spool);
        match common_ancestor(&paths) {
            Some(root) => root,
            None => fatal!(
                EX_CONFIG,
                "chroot_system requires every storage path to be absolute \
                 and under one common directory"
            ),
        }
    } else {
        config.storage.spool.clone()
    };

    let pre_chroot = root.clone();
    if let Err(exit) =
        unix_privileges::assume_system(&config.security, &mut root)
    {
        exit.exit();
    }

    if config.security.chroot_system {
        let rebase = |p: &PathBuf| match p.strip_prefix(&pre_chroot) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => fatal!(
                EX_CONFIG,
                "'{}' escaped the computed storage root '{}'",
                p.display(),
                pre_chroot.display()
            ),
        };
        config.storage.spool = rebase(&config.storage.spool);
        config.storage.filesystems =
            config.storage.filesystems.iter().map(rebase).collect();
    }
}

fn common_ancestor(paths: &[&Path]) -> Option<PathBuf> {
    let mut iter = paths.iter();
    let mut acc = iter.next()?.to_path_buf();
    if !acc.is_absolute() {
        return None;
    }

    for p in iter {
        if !p.is_absolute() {
            return None;
        }
        while !p.starts_with(&acc) {
            if !acc.pop() {
                return None;
            }
        }
    }
    Some(acc)
}
