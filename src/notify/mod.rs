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

//! New-mail notification fan-out.
//!
//! Delivery raises a notification after a message lands in a mailbox.
//! Raising must never block or fail delivery, so the channel-backed
//! implementation hands events to a background thread and drops them on
//! overflow.

use std::sync::Arc;

use crossbeam::channel;
use log::{debug, warn};

use crate::mbox::model::{MessageId, Uid};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMail {
    pub uid: Uid,
    pub message_id: MessageId,
    pub folder: u32,
}

pub trait Notifier: Send + Sync {
    fn new_mail(&self, event: NewMail);
}

/// Notifier that just logs. Used when no notification service is
/// configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn new_mail(&self, event: NewMail) {
        debug!(
            "new mail for uid {} (mid {}, folder {})",
            event.uid, event.message_id, event.folder
        );
    }
}

const CHANNEL_DEPTH: usize = 1024;

/// Decouples delivery from a possibly-slow notification sink.
pub struct ChannelNotifier {
    tx: channel::Sender<NewMail>,
}

impl ChannelNotifier {
    /// Spawn the drain thread and return the non-blocking front end.
    pub fn spawn(sink: Arc<dyn Notifier>) -> Arc<Self> {
        let (tx, rx) = channel::bounded::<NewMail>(CHANNEL_DEPTH);
        std::thread::spawn(move || {
            for event in rx {
                sink.new_mail(event);
            }
        });
        Arc::new(ChannelNotifier { tx })
    }
}

impl Notifier for ChannelNotifier {
    fn new_mail(&self, event: NewMail) {
        // Notifications are advisory; clients poll anyway.
        if let Err(channel::TrySendError::Full(event)) =
            self.tx.try_send(event)
        {
            warn!(
                "notification channel full, dropping event for uid {}",
                event.uid
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    struct Collector(Mutex<Vec<NewMail>>, channel::Sender<()>);

    impl Notifier for Collector {
        fn new_mail(&self, event: NewMail) {
            self.0.lock().unwrap().push(event);
            let _ = self.1.send(());
        }
    }

    #[test]
    fn events_reach_the_sink() {
        let (done_tx, done_rx) = channel::unbounded();
        let collector =
            Arc::new(Collector(Mutex::new(Vec::new()), done_tx));
        let notifier = ChannelNotifier::spawn(
            Arc::clone(&collector) as Arc<dyn Notifier>
        );

        let event = NewMail {
            uid: Uid(100),
            message_id: MessageId(7),
            folder: crate::mbox::model::FOLDER_INBOX,
        };
        notifier.new_mail(event.clone());

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("event never drained");
        assert_eq!(vec![event], *collector.0.lock().unwrap());
    }
}
