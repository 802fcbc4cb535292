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

use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the mail server.
    ///
    /// This starts the queue workers and the mailbox cache and runs until
    /// killed. Send SIGUSR1 to flush all resident mailboxes to disk
    /// immediately (for example before taking a filesystem snapshot).
    Serve(CommonOptions),
    /// Inspect the message queues.
    Queue(QueueSubcommand),
    Deliver(DeliverSubcommand),
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Serve(ref mut c) => mem::take(c),
            Command::Queue(QueueSubcommand::List(ref mut c)) => mem::take(c),
            Command::Deliver(ref mut c) => mem::take(&mut c.common),
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `packmule.toml` etc
    /// [default: /etc/packmule or /usr/local/etc/packmule]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
enum QueueSubcommand {
    /// List every spooled entry, one line per entry, grouped by
    /// destination queue.
    ///
    /// This reads the spool directly and may be run while the server is
    /// serving; an entry being transferred at that instant can appear or
    /// vanish mid-listing.
    List(CommonOptions),
}

/// Submit a message from the command line.
///
/// The message body is read from standard input. Recipient names are
/// resolved through the directory exactly as for mail submitted by a user;
/// unresolvable recipients produce a bounce to the sender as usual.
///
/// If the first line of the input ends with a UNIX line ending, all line
/// feeds in the input are converted to DOS line endings; otherwise the
/// input is passed through bit-for-bit.
///
/// The running server does not watch the spool for entries added behind its
/// back, so mail this command leaves queued for a peer or for the Internet
/// is picked up when the server next starts. Local recipients are delivered
/// immediately, in-process.
#[derive(StructOpt)]
pub(super) struct DeliverSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Send as this user [default: the postmaster].
    #[structopt(short, long)]
    pub(super) from: Option<String>,

    /// Subject line of the message.
    #[structopt(short, long, default_value = "")]
    pub(super) subject: String,

    /// Mark the message urgent.
    #[structopt(long)]
    pub(super) urgent: bool,

    /// Show recipients "(recipients withheld)" instead of the To: line.
    #[structopt(long)]
    pub(super) hide_recipients: bool,

    /// The recipient names.
    #[structopt(required = true)]
    pub(super) recipients: Vec<String>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/packmule/packmule.toml").is_file() {
            "/etc/packmule".to_owned().into()
        } else if Path::new("/usr/local/etc/packmule/packmule.toml").is_file()
        {
            "/usr/local/etc/packmule".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/packmule nor /usr/local/etc/packmule looks\n\
                 like the Packmule root; use --root=/path/to/packmule if\n\
                 your installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("packmule.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        eprintln!("Error reading '{}': {}", system_config_path.display(), e);
        EX_CONFIG.exit();
    }

    let system_config: SystemConfig =
        match toml::from_slice(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            }
        };

    init_logging(&root);

    match cmd {
        Command::Serve(_) => super::serve::serve(system_config, root),
        Command::Queue(QueueSubcommand::List(_)) => {
            super::queue::list(system_config)
        }
        Command::Deliver(cmd) => super::deliver::deliver(system_config, cmd),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
    } else {
        // Right now we have this awkward situation where you can use log4rs
        // *or* syslog, because log4rs-syslog hasn't been updated in quite a
        // while.
        //
        // If anything goes wrong here there is nobody useful to tell about
        // it, since stderr is not a terminal.
        let log_config_file = root.join("logging.toml");
        if log_config_file.is_file() {
            log4rs::init_file(
                log_config_file,
                log4rs::file::Deserializers::new(),
            )
            .expect("Failed to initialise logging");
        } else {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_MAIL,
                hostname: None,
                process: env!("CARGO_PKG_NAME").to_owned(),
                pid: nix::unistd::getpid().as_raw(),
            };

            let logger =
                syslog::unix(formatter).expect("Failed to connect to syslog");
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
                .expect("Failed to initialise logging");
        }
    }
}
