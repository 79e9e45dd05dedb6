// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;

/// Errors surfaced by the volume manager.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// The referenced Logical Volume does not exist.
    UnknownLv(String),
    /// An LV with this name already exists in the VG.
    DuplicateLv(String),
    /// The allocator could not gather enough free extents.
    OnlyThisMuchFree { needed: u64, available: u64 },
    /// Everything else: parse errors, checksum failures, device I/O,
    /// unsupported segment types, internal invariant violations.
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::UnknownLv(ref name) => write!(f, "unknown logical volume {}", name),
            Error::DuplicateLv(ref name) => {
                write!(f, "logical volume {} already exists", name)
            }
            Error::OnlyThisMuchFree { needed, available } => write!(
                f,
                "only {} free extents available, {} needed",
                available, needed
            ),
            Error::Msg(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Msg(format!("I/O error: {}", err))
    }
}
