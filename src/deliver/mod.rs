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

//! Message delivery.
//!
//! `engine` turns a submission into per-destination queue entries and
//! in-process local deliveries; `local` is the single place a message
//! enters a mailbox; `bounce` and `vacation` generate the system's own
//! mail.

pub mod bounce;
pub mod engine;
pub mod local;
pub mod partition;
#[cfg(test)]
pub(crate) mod testutil;
pub mod vacation;

pub use self::engine::{DeliverReq, Delivery};
