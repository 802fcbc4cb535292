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

/// Determine whether the given name is "safe".
///
/// This is used to validate names that become file system elements (folder
/// names, peer server names) and fields of the line-oriented control and
/// summary formats. It excludes empty names, patterns that cause directory
/// traversal, ASCII control characters (which would break the CRLF-terminated
/// control file), and the comma used as the packed-record field separator.
///
/// This does not care about whether the name is ultimately a valid file name;
/// for that, we simply rely on the OS rejecting it.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        // Block directory traversal through .. and creation of hidden files
        // on UNIX
        name.chars().next() != Some('.') &&
        name.find('/').is_none() &&
        // Only a path separator on Windows, but always block since it has
        // high potential of causing problems
        name.find('\\').is_none() &&
        // Field separator in packed summary and control records
        name.find(',').is_none() &&
        // Don't allow any ASCII control characters
        name.find(|c| c < ' ' || c == '\x7F').is_none()
}
