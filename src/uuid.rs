// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! LVM-format identifiers.
//!
//! These are not RFC 4122 UUIDs: LVM ids are 32 characters drawn from
//! `[A-Za-z0-9]`, displayed with hyphens splitting the groups
//! 6-4-4-4-4-4-6.

use std::fmt;

use rand::Rng;

use crate::{Error, Result};

pub const UUID_LEN: usize = 32;

const UUID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

// Hyphen group widths used by LVM's display form.
const UUID_GROUPS: [usize; 7] = [6, 4, 4, 4, 4, 4, 6];

/// A 32-character LVM identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid([u8; UUID_LEN]);

impl Uuid {
    /// Generate a fresh random id.
    pub fn create() -> Uuid {
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; UUID_LEN];

        for b in buf.iter_mut() {
            *b = UUID_CHARS[rng.gen_range(0..UUID_CHARS.len())];
        }

        Uuid(buf)
    }

    /// Parse an id, accepting both the hyphenated display form and the
    /// bare 32-character form.
    pub fn of_string(s: &str) -> Result<Uuid> {
        let stripped: Vec<u8> = s.bytes().filter(|&b| b != b'-').collect();

        Self::from_bytes(&stripped)
    }

    /// Build an id from 32 raw alphabet bytes, e.g. the uuid field of an
    /// on-disk PV header.
    pub fn from_bytes(buf: &[u8]) -> Result<Uuid> {
        if buf.len() != UUID_LEN {
            return Err(Error::Msg(format!(
                "bad uuid length {}, expected {}",
                buf.len(),
                UUID_LEN
            )));
        }

        let mut arr = [0u8; UUID_LEN];
        for (dst, &b) in arr.iter_mut().zip(buf) {
            if !b.is_ascii_alphanumeric() {
                return Err(Error::Msg(format!("bad uuid character {:?}", b as char)));
            }
            *dst = b;
        }

        Ok(Uuid(arr))
    }

    /// The raw 32 alphabet bytes, as written to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut pos = 0;
        for (i, &width) in UUID_GROUPS.iter().enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            // the alphabet is ASCII, so slicing by bytes is safe
            write!(f, "{}", std::str::from_utf8(&self.0[pos..pos + width]).unwrap())?;
            pos += width;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}
