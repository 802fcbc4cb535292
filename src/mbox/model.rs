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

use std::fmt;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Numeric user identifier, the primary key for a mailbox.
///
/// Negative values are pseudo-recipients which never correspond to a real
/// mailbox; they are exploded by the partition step of delivery.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
)]
pub struct Uid(pub i64);

/// "Deliver to every user on every server."
pub const UID_ALL_USERS: Uid = Uid(-2);
/// "Deliver a public-mailing-list update to every *other* server."
pub const UID_LIST_UPDATE: Uid = Uid(-3);

impl Uid {
    pub fn is_pseudo(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permanent, globally unique identifier assigned once per logical message.
///
/// Distinct from a queue id: one message id may appear in several queue
/// entries simultaneously (fan-out, forwarding, enclosure cloning).
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Folder numbers 0-2 are reserved in every mailbox; user-defined folders
/// start at `FIRST_USER_FOLDER` and may have holes where folders were
/// removed (the slot is retained so surviving folders keep their numbers).
pub const FOLDER_TRASH: u32 = 0;
pub const FOLDER_AUDIT: u32 = 1;
pub const FOLDER_INBOX: u32 = 2;
pub const FIRST_USER_FOLDER: u32 = 3;

pub const WELL_KNOWN_FOLDERS: [(u32, &str); 3] = [
    (FOLDER_TRASH, "Trash"),
    (FOLDER_AUDIT, "Audit"),
    (FOLDER_INBOX, "Inbox"),
];

bitflags::bitflags! {
    /// Per-message status flags carried in the summary record.
    #[derive(Default)]
    pub struct SummaryFlags: u32 {
        const UNREAD  = 1 << 0;
        const URGENT  = 1 << 1;
        /// Sender requested a read receipt.
        const RECEIPT = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Per-recipient behaviour flags.
    #[derive(Default)]
    pub struct RecipFlags: u32 {
        /// Omit from rendered recipient header lines.
        const NOSHOW   = 1 << 0;
        /// Resolution succeeded but sending to this recipient is forbidden.
        const NOSEND   = 1 << 1;
        /// Forward exactly once; do not follow further forwarding.
        const ONESHOT  = 1 << 2;
        /// Recipient has an active vacation message.
        const VACATION = 1 << 3;
    }
}

/// Compact metadata record for one message within a folder.
///
/// The packed line form is shared between folder summary files and line 2 of
/// the spool control file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub message_id: MessageId,
    pub date: DateTime<Utc>,
    /// Size in bytes of the message data.
    pub size: u64,
    pub flags: SummaryFlags,
    pub sender: String,
    pub subject: String,
}

impl Summary {
    /// Encode as a single packed line (no terminator).
    ///
    /// Fixed-width fields come first so that the free-form sender and subject
    /// cannot confuse the parse; both are escaped.
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.message_id,
            self.date.timestamp(),
            self.size,
            self.flags.bits(),
            escape_field(&self.sender),
            escape_field(&self.subject),
        )
    }

    pub fn decode(line: &str) -> Result<Self, Error> {
        let mut fields = line.splitn(6, ',');
        let message_id = MessageId(parse_field(fields.next())?);
        let stamp: i64 = parse_field(fields.next())?;
        let size = parse_field(fields.next())?;
        let bits: u32 = parse_field(fields.next())?;
        let sender =
            unescape_field(fields.next().ok_or(Error::BadControlFile)?);
        let subject =
            unescape_field(fields.next().ok_or(Error::BadControlFile)?);

        Ok(Summary {
            message_id,
            date: Utc
                .timestamp_opt(stamp, 0)
                .single()
                .ok_or(Error::BadControlFile)?,
            size,
            flags: SummaryFlags::from_bits_truncate(bits),
            sender,
            subject,
        })
    }
}

/// Where a resolved recipient's mail should go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipAddr {
    /// A mailbox in the peer group: a server name and, once assigned, the
    /// disk volume on that server.
    Hosted {
        uid: Uid,
        server: String,
        filesystem: String,
    },
    /// An arbitrary Internet address, handled by the SMTP path.
    Internet { address: String },
}

/// Outcome of resolving a recipient name through the directory service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipStatus {
    Ok,
    Ambiguous,
    BadAddress,
    NoSendPermission,
    DirectoryUnavailable,
    ForwardingLoop,
}

impl RecipStatus {
    pub fn is_ok(self) -> bool {
        RecipStatus::Ok == self
    }

    /// Human-readable reason, used in the bounce text shown to the sender.
    pub fn reason(self) -> &'static str {
        match self {
            RecipStatus::Ok => "delivered",
            RecipStatus::Ambiguous => "name matches more than one user",
            RecipStatus::BadAddress => "no such user",
            RecipStatus::NoSendPermission => {
                "you do not have permission to send to this user"
            }
            RecipStatus::DirectoryUnavailable => {
                "the directory service could not be reached"
            }
            RecipStatus::ForwardingLoop => "mail forwarding loop detected",
        }
    }
}

/// One entry of a resolved recipient list.
///
/// Recipient lists are ordinary ordered `Vec<Recip>`s; iteration order is
/// the order recipients were given in.
#[derive(Clone, Debug)]
pub struct Recip {
    /// The name as the sender wrote it (also the display name).
    pub name: String,
    pub addr: RecipAddr,
    pub status: RecipStatus,
    pub flags: RecipFlags,
    /// When the routing information was obtained from the directory; local
    /// queue processing re-resolves entries older than the configured age.
    pub resolved_at: DateTime<Utc>,
    /// Recipients introduced by the same mailing-list expansion share a
    /// group; bcc visibility is per-group.
    pub group: u32,
}

impl Recip {
    pub fn hosted(
        name: impl Into<String>,
        uid: Uid,
        server: impl Into<String>,
        filesystem: impl Into<String>,
    ) -> Self {
        Recip {
            name: name.into(),
            addr: RecipAddr::Hosted {
                uid,
                server: server.into(),
                filesystem: filesystem.into(),
            },
            status: RecipStatus::Ok,
            flags: RecipFlags::empty(),
            resolved_at: Utc::now(),
            group: 0,
        }
    }

    pub fn internet(address: impl Into<String>) -> Self {
        let address = address.into();
        Recip {
            name: address.clone(),
            addr: RecipAddr::Internet { address },
            status: RecipStatus::Ok,
            flags: RecipFlags::empty(),
            resolved_at: Utc::now(),
            group: 0,
        }
    }

    pub fn uid(&self) -> Option<Uid> {
        match self.addr {
            RecipAddr::Hosted { uid, .. } => Some(uid),
            RecipAddr::Internet { .. } => None,
        }
    }

    pub fn is_hosted_on(&self, server: &str) -> bool {
        match self.addr {
            RecipAddr::Hosted { server: ref s, .. } => s == server,
            RecipAddr::Internet { .. } => false,
        }
    }
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
) -> Result<T, Error> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or(Error::BadControlFile)
}

/// Escape a free-form field for inclusion in a packed record.
///
/// `%`, the field separator, and line terminators are percent-encoded; the
/// result contains no byte that the line- and field-splitting code treats
/// specially.
pub fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ',' => out.push_str("%2C"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if '%' != c {
            out.push(c);
            continue;
        }

        let hex: String = chars.by_ref().take(2).collect();
        match u8::from_str_radix(&hex, 16) {
            Ok(b) => out.push(b as char),
            // Tolerate stray %: pass it and whatever followed through.
            Err(_) => {
                out.push('%');
                out.push_str(&hex);
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn summary() -> Summary {
        Summary {
            message_id: MessageId(42),
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            size: 1234,
            flags: SummaryFlags::UNREAD | SummaryFlags::URGENT,
            sender: "Bob Dobbs".to_owned(),
            subject: "Re: lunch, or 100% of it".to_owned(),
        }
    }

    #[test]
    fn summary_round_trip() {
        let s = summary();
        assert_eq!(s, Summary::decode(&s.encode()).unwrap());
    }

    #[test]
    fn summary_escaping() {
        let encoded = summary().encode();
        // The free-form fields must not leak a raw separator
        assert_eq!(5, encoded.matches(',').count());
        assert!(encoded.contains("lunch%2C or 100%25 of it"));
    }

    #[test]
    fn summary_decode_rejects_garbage() {
        assert_matches!(
            Err(crate::support::error::Error::BadControlFile),
            Summary::decode("")
        );
        assert_matches!(
            Err(crate::support::error::Error::BadControlFile),
            Summary::decode("42,not-a-date,0,0,a,b")
        );
        assert_matches!(
            Err(crate::support::error::Error::BadControlFile),
            Summary::decode("42,100,12")
        );
    }

    proptest! {
        #[test]
        fn field_escaping_round_trips(s in "[ -~\r\n]{0,64}") {
            let escaped = escape_field(&s);
            prop_assert!(!escaped.contains(','));
            prop_assert!(!escaped.contains('\r'));
            prop_assert!(!escaped.contains('\n'));
            prop_assert_eq!(s, unescape_field(&escaped));
        }
    }
}
