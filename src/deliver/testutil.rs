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

//! A complete in-memory server for delivery and queue tests: static
//! directory, mailbox cache, spool, and scripted transports.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::dnd::StaticDirectory;
use crate::mbox::cache::MboxCache;
use crate::mbox::model::{Summary, Uid, FOLDER_INBOX};
use crate::notify::LogNotifier;
use crate::queue::control::ControlFile;
use crate::queue::manager::QueueManager;
use crate::support::error::Error;
use crate::support::system_config::{PeerConfig, SystemConfig, UserEntry};
use crate::xfer::{
    PeerConn, PeerTransport, RecipDisposition, SmtpConn, SmtpTransport,
    XferOutcome,
};

use super::engine::Delivery;

pub(crate) const UID_ALICE: Uid = Uid(100);
pub(crate) const UID_BOB: Uid = Uid(101);
pub(crate) const UID_CAROL: Uid = Uid(102);

pub(crate) struct Fixture {
    pub tmp: tempfile::TempDir,
    pub config: Arc<SystemConfig>,
    pub directory: Arc<StaticDirectory>,
    pub cache: Arc<MboxCache>,
    pub queues: Arc<QueueManager>,
    pub delivery: Arc<Delivery>,
    pub smtp: Arc<ScriptedSmtp>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| ())
    }

    pub fn with_config(tweak: impl FnOnce(&mut SystemConfig)) -> Self {
        crate::init_test_log();

        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = SystemConfig::default();
        config.server.name = "alpha".to_owned();
        config.server.postmaster = "postmaster".to_owned();
        config.storage.filesystems = vec![tmp.path().join("fs0")];
        config.storage.spool = tmp.path().join("spool");
        config.peers.push(PeerConfig {
            name: "beta".to_owned(),
            host: "beta.example.org".to_owned(),
            command: vec![],
        });
        for (name, uid) in
            &[("alice", UID_ALICE), ("bob", UID_BOB), ("carol", UID_CAROL)]
        {
            config.users.push(UserEntry {
                name: (*name).to_owned(),
                uid: uid.0,
                server: "alpha".to_owned(),
                filesystem: String::new(),
            });
        }
        config.users.push(UserEntry {
            name: "dave".to_owned(),
            uid: 200,
            server: "beta".to_owned(),
            filesystem: String::new(),
        });
        tweak(&mut config);

        std::fs::create_dir_all(&config.storage.filesystems[0]).unwrap();

        let config = Arc::new(config);
        let directory = Arc::new(StaticDirectory::from_config(&config));
        let cache = MboxCache::new(
            Arc::clone(&config),
            Arc::clone(&directory) as Arc<dyn crate::dnd::Directory>,
        );
        let queues = Arc::new(QueueManager::new(&config).unwrap());
        let smtp = Arc::new(ScriptedSmtp::new());
        let delivery = Delivery::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&queues),
            Arc::clone(&directory) as Arc<dyn crate::dnd::Directory>,
            Arc::new(LogNotifier),
            Arc::clone(&smtp) as Arc<dyn SmtpTransport>,
        )
        .unwrap();

        Fixture {
            tmp,
            config,
            directory,
            cache,
            queues,
            delivery,
            smtp,
        }
    }

    pub fn inbox(&self, uid: Uid) -> Vec<Summary> {
        let r = self.cache.find(uid, None, true).unwrap();
        let mut state = r.lock();
        state.summaries(FOLDER_INBOX).unwrap().to_vec()
    }

    pub fn inbox_message(&self, uid: Uid, ix: usize) -> Vec<u8> {
        let r = self.cache.find(uid, None, true).unwrap();
        let mut state = r.lock();
        let mid = state.summaries(FOLDER_INBOX).unwrap()[ix].message_id;
        state.read_message(mid).unwrap()
    }
}

type SmtpScript = VecDeque<Vec<(String, RecipDisposition)>>;

#[derive(Default)]
pub(crate) struct SmtpState {
    pub script: Mutex<SmtpScript>,
    /// (sender, recipients) of every hand-off attempted.
    pub sent: Mutex<Vec<(String, Vec<String>)>>,
}

pub(crate) struct ScriptedSmtp {
    pub state: Arc<SmtpState>,
}

impl ScriptedSmtp {
    pub fn new() -> Self {
        ScriptedSmtp {
            state: Arc::new(SmtpState::default()),
        }
    }

    pub fn push_script(&self, step: Vec<(String, RecipDisposition)>) {
        self.state.script.lock().unwrap().push_back(step);
    }
}

impl SmtpTransport for ScriptedSmtp {
    fn connect(&self) -> Result<Box<dyn SmtpConn>, Error> {
        Ok(Box::new(ScriptedSmtpConn(Arc::clone(&self.state))))
    }
}

struct ScriptedSmtpConn(Arc<SmtpState>);

impl SmtpConn for ScriptedSmtpConn {
    fn send_message(
        &mut self,
        sender: &str,
        recips: &[String],
        _data: &Path,
    ) -> Result<Vec<(String, RecipDisposition)>, Error> {
        self.0
            .sent
            .lock()
            .unwrap()
            .push((sender.to_owned(), recips.to_vec()));
        Ok(match self.0.script.lock().unwrap().pop_front() {
            Some(step) => step,
            None => recips
                .iter()
                .map(|r| (r.clone(), RecipDisposition::Accepted))
                .collect(),
        })
    }
}

#[derive(Default)]
pub(crate) struct PeerState {
    pub script: Mutex<VecDeque<XferOutcome>>,
    /// Recipient counts of every control file sent.
    pub sent: Mutex<Vec<usize>>,
}

pub(crate) struct ScriptedPeer {
    pub state: Arc<PeerState>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        ScriptedPeer {
            state: Arc::new(PeerState::default()),
        }
    }

    pub fn push_script(&self, outcome: XferOutcome) {
        self.state.script.lock().unwrap().push_back(outcome);
    }
}

impl PeerTransport for ScriptedPeer {
    fn connect(
        &self,
        _peer: &PeerConfig,
    ) -> Result<Box<dyn PeerConn>, Error> {
        Ok(Box::new(ScriptedPeerConn(Arc::clone(&self.state))))
    }
}

struct ScriptedPeerConn(Arc<PeerState>);

impl PeerConn for ScriptedPeerConn {
    fn send_message(
        &mut self,
        control: &ControlFile,
        _data: &Path,
    ) -> Result<XferOutcome, Error> {
        self.0.sent.lock().unwrap().push(control.recips.len());
        Ok(self
            .0
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(XferOutcome::Done))
    }
}
