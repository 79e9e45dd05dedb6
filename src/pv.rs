// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical Volumes

use std::fmt;
use std::fmt::Write;

use crate::allocator::Allocation;
use crate::parser::{parse_err, Entry, LvmTextMap, TextMapOps};
use crate::pvlabel::PvLabel;
use crate::uuid::Uuid;
use crate::{Error, Result};

pub const MAX_NAME_LEN: usize = 128;

/// The name of a PV within its VG. Used as the key linking LV segments
/// to physical volumes, so it must survive a round trip through the
/// text metadata as a section key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PvName(String);

impl PvName {
    pub fn of_string(s: &str) -> Result<PvName> {
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(Error::Msg(format!("bad PV name length {}", s.len())));
        }
        // first char must lex as an ident start
        let first = s.as_bytes()[0];
        if !(first.is_ascii_alphabetic() || first == b'_' || first == b'.') {
            return Err(Error::Msg(format!("bad PV name '{}'", s)));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-' || b == b'+')
        {
            return Err(Error::Msg(format!("bad PV name '{}'", s)));
        }
        Ok(PvName(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Physical Volume that is a member of a VG.
#[derive(Debug, PartialEq, Clone)]
pub struct Pv {
    /// The UUID, matching the on-disk label.
    pub id: Uuid,
    /// The name keying this PV within the VG.
    pub name: PvName,
    /// Path of the device this PV was last seen at.
    pub device: String,
    /// Status strings, normally just ALLOCATABLE.
    pub status: Vec<String>,
    /// Sector where extent 0 starts.
    pub pe_start: u64,
    /// Number of extents in the PV.
    pub pe_count: u64,
    /// The label block read from (or written to) the device.
    pub label: PvLabel,
}

impl Pv {
    /// Every extent this PV contributes to the VG.
    pub fn full_extents(&self) -> Allocation {
        Allocation::create(&self.name, self.pe_count)
    }

    pub fn to_text(&self, out: &mut String) {
        writeln!(out, "{} {{", self.name).unwrap();
        writeln!(out, "id = \"{}\"", self.id).unwrap();
        writeln!(out, "device = \"{}\"", crate::parser::escaped(&self.device)).unwrap();
        let status: Vec<_> = self.status.iter().map(|x| format!("\"{}\"", x)).collect();
        writeln!(out, "status = [{}]", status.join(", ")).unwrap();
        writeln!(out, "pe_start = {}", self.pe_start).unwrap();
        writeln!(out, "pe_count = {}", self.pe_count).unwrap();
        writeln!(out, "}}").unwrap();
    }

    pub fn from_textmap(name: &str, map: &LvmTextMap, label: PvLabel) -> Result<Pv> {
        let path = format!("physical_volumes/{}", name);

        let id = map
            .string_from_textmap("id")
            .ok_or_else(|| parse_err(&path, "id"))?;
        let device = map
            .string_from_textmap("device")
            .ok_or_else(|| parse_err(&path, "device"))?;
        let pe_start = map
            .i64_from_textmap("pe_start")
            .ok_or_else(|| parse_err(&path, "pe_start"))?;
        let pe_count = map
            .i64_from_textmap("pe_count")
            .ok_or_else(|| parse_err(&path, "pe_count"))?;

        let status = status_from_textmap(map, &path)?;

        Ok(Pv {
            id: Uuid::of_string(id)?,
            name: PvName::of_string(name)?,
            device: device.to_string(),
            status,
            pe_start: pe_start as u64,
            pe_count: pe_count as u64,
            label,
        })
    }
}

// status may be either a string or a list of strings
pub fn status_from_textmap(map: &LvmTextMap, path: &str) -> Result<Vec<String>> {
    match map.get("status") {
        Some(&Entry::String(ref x)) => Ok(vec![x.clone()]),
        Some(&Entry::List(ref x)) => Ok(x
            .iter()
            .filter_map(|item| match *item {
                Entry::String(ref x) => Some(x.clone()),
                _ => None,
            })
            .collect()),
        _ => Err(parse_err(path, "status")),
    }
}
