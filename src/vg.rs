// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Volume Groups
//!
//! [`Metadata`] is an immutable value: every mutation goes through
//! [`do_op`], which returns a fresh value with the op applied and the
//! seqno advanced. Ops are deliberately idempotent so a journal can
//! replay them against metadata that may already contain their
//! effects.

use std::collections::BTreeMap;
use std::fmt::Write;

use log::debug;

use crate::allocator::{self, Allocation};
use crate::lv::{self, Lv, LvStatus, Segment, Tag};
use crate::parser::{buf_to_textmap, escaped, parse_err, Entry, TextMapOps};
use crate::pv::{status_from_textmap, Pv, PvName, MAX_NAME_LEN};
use crate::pvlabel::PvLabel;
use crate::uuid::Uuid;
use crate::{Error, Result};

/// Default extent size in 512-byte sectors (4MiB).
pub const DEFAULT_EXTENT_SIZE: u64 = 8192;

/// VG status flags.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VgStatus {
    Read,
    Write,
    Resizeable,
    Clustered,
}

impl VgStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            VgStatus::Read => "READ",
            VgStatus::Write => "WRITE",
            VgStatus::Resizeable => "RESIZEABLE",
            VgStatus::Clustered => "CLUSTERED",
        }
    }

    pub fn of_string(s: &str) -> Result<VgStatus> {
        match s {
            "READ" => Ok(VgStatus::Read),
            "WRITE" => Ok(VgStatus::Write),
            "RESIZEABLE" => Ok(VgStatus::Resizeable),
            "CLUSTERED" => Ok(VgStatus::Clustered),
            _ => Err(Error::Msg(format!("unknown VG status {}", s))),
        }
    }
}

/// A Volume Group: multiple Physical Volumes treated as a storage pool
/// that Logical Volumes are allocated out of.
#[derive(Debug, PartialEq, Clone)]
pub struct Metadata {
    /// Name.
    pub name: String,
    /// Uuid.
    pub id: Uuid,
    /// Host that created the VG.
    pub creation_host: String,
    /// Unix time the VG was created.
    pub creation_time: i64,
    /// The generation of metadata this value represents.
    pub seqno: u32,
    /// Status.
    pub status: Vec<VgStatus>,
    /// Size of each extent, in 512-byte sectors.
    pub extent_size: u64,
    /// Maximum number of LVs, 0 means no limit.
    pub max_lv: u64,
    /// Maximum number of PVs, 0 means no limit.
    pub max_pv: u64,
    /// Physical Volumes within this volume group, in allocation order.
    pub pvs: Vec<Pv>,
    /// Logical Volumes within this volume group, keyed by id.
    pub lvs: BTreeMap<Uuid, Lv>,
    /// Extents not allocated to any LV.
    pub free_space: Allocation,
}

/// A metadata mutation. Applying one that has already been applied is
/// a no-op, which is what makes journal replay safe.
#[derive(Debug, PartialEq, Clone)]
pub enum Op {
    LvCreate(Lv),
    LvExpand { id: Uuid, segments: Vec<Segment> },
    LvReduce { id: Uuid, new_extent_count: u64 },
    LvTransfer { src: Uuid, dst: Uuid, segments: Vec<Segment> },
    LvRemove(Uuid),
    LvRename { id: Uuid, new_name: String },
    LvAddTag { id: Uuid, tag: Tag },
    LvRemoveTag { id: Uuid, tag: Tag },
    LvSetStatus { id: Uuid, status: Vec<LvStatus> },
}

impl Metadata {
    pub fn extent_bytes(&self) -> u64 {
        self.extent_size * crate::block::SECTOR_SIZE as u64
    }

    /// Extents needed to hold `bytes`, rounding up.
    pub fn bytes_to_extents(&self, bytes: u64) -> u64 {
        (bytes + self.extent_bytes() - 1) / self.extent_bytes()
    }

    /// Every extent contributed by every PV.
    pub fn full_extents(&self) -> Allocation {
        self.pvs.iter().fold(Allocation::default(), |acc, pv| {
            allocator::merge(&acc, &pv.full_extents())
        })
    }

    /// The total number of extents in the volume group.
    pub fn extents(&self) -> u64 {
        self.pvs.iter().map(|pv| pv.pe_count).sum()
    }

    /// The total number of free extents in the volume group.
    pub fn extents_free(&self) -> u64 {
        self.free_space.size()
    }

    /// The total number of extents in use by LVs.
    pub fn extents_in_use(&self) -> u64 {
        self.lvs.values().map(|lv| lv.to_allocation().size()).sum()
    }

    pub fn pv_get(&self, name: &PvName) -> Option<&Pv> {
        self.pvs.iter().find(|pv| pv.name == *name)
    }

    pub fn lv_get(&self, id: &Uuid) -> Option<&Lv> {
        self.lvs.get(id)
    }

    pub fn lv_by_name(&self, name: &str) -> Option<&Lv> {
        self.lvs.values().find(|lv| lv.name == name)
    }

    /// Names of the LVs in the VG.
    pub fn lv_list(&self) -> Vec<String> {
        self.lvs.values().map(|lv| lv.name.clone()).collect()
    }

    /// Verify the global invariants. Called after every state change;
    /// a failure here is an accounting bug, not a user error.
    pub fn check(&self) -> Result<()> {
        let mut names = Vec::new();
        for lv in self.lvs.values() {
            if names.contains(&&lv.name) {
                return Err(Error::Msg(format!(
                    "vg {}: duplicate LV name {}",
                    self.name, lv.name
                )));
            }
            names.push(&lv.name);

            lv::segments_well_formed(&lv.name, &lv.segments)?;

            for seg in &lv.segments {
                for (name, _) in seg.to_allocation().entries() {
                    if self.pv_get(name).is_none() {
                        return Err(Error::Msg(format!(
                            "vg {}: LV {} references unknown PV {}",
                            self.name, lv.name, name
                        )));
                    }
                }
            }
        }

        // free space and LV allocations must partition the PVs exactly
        let full = self.full_extents();
        let mut covered = self.free_space.clone();
        let mut covered_size = self.free_space.size();
        for lv in self.lvs.values() {
            let alloc = lv.to_allocation();
            covered_size += alloc.size();
            covered = allocator::merge(&covered, &alloc);
        }
        if covered.sorted_entries() != full.sorted_entries() || covered_size != full.size() {
            return Err(Error::Msg(format!(
                "vg {}: free space accounting is inconsistent",
                self.name
            )));
        }

        Ok(())
    }

    /// Build an op creating a new linear LV of at least `bytes` bytes.
    pub fn create(&self, name: &str, bytes: u64, host: &str, time: i64) -> Result<Op> {
        valid_lv_name(name)?;
        if self.lv_by_name(name).is_some() {
            return Err(Error::DuplicateLv(name.to_string()));
        }

        let extents = std::cmp::max(1, self.bytes_to_extents(bytes));
        let alloc = allocator::find(&self.free_space, extents)?;

        Ok(Op::LvCreate(Lv {
            id: Uuid::create(),
            name: name.to_string(),
            tags: Vec::new(),
            status: vec![LvStatus::Read, LvStatus::Write, LvStatus::Visible],
            creation_host: host.to_string(),
            creation_time: time,
            segments: lv::linear(0, &alloc),
        }))
    }

    /// Build an op resizing an LV to hold at least `bytes` bytes.
    pub fn resize(&self, name: &str, bytes: u64) -> Result<Op> {
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;

        let new_extents = std::cmp::max(1, self.bytes_to_extents(bytes));
        let current = lv.size_in_extents();

        if new_extents > current {
            let alloc = allocator::find(&self.free_space, new_extents - current)?;
            Ok(Op::LvExpand {
                id: lv.id,
                segments: lv::linear(current, &alloc),
            })
        } else {
            Ok(Op::LvReduce {
                id: lv.id,
                new_extent_count: new_extents,
            })
        }
    }

    pub fn remove(&self, name: &str) -> Result<Op> {
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        Ok(Op::LvRemove(lv.id))
    }

    pub fn rename(&self, name: &str, new_name: &str) -> Result<Op> {
        valid_lv_name(new_name)?;
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        match self.lv_by_name(new_name) {
            Some(other) if other.id != lv.id => Err(Error::DuplicateLv(new_name.to_string())),
            _ => Ok(Op::LvRename {
                id: lv.id,
                new_name: new_name.to_string(),
            }),
        }
    }

    pub fn add_tag(&self, name: &str, tag: &str) -> Result<Op> {
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        Ok(Op::LvAddTag {
            id: lv.id,
            tag: Tag::of_string(tag)?,
        })
    }

    pub fn remove_tag(&self, name: &str, tag: &str) -> Result<Op> {
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        Ok(Op::LvRemoveTag {
            id: lv.id,
            tag: Tag::of_string(tag)?,
        })
    }

    pub fn set_status(&self, name: &str, status: Vec<LvStatus>) -> Result<Op> {
        let lv = self
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        Ok(Op::LvSetStatus { id: lv.id, status })
    }
}

fn valid_lv_name(s: &str) -> Result<()> {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return Err(Error::Msg(format!("bad LV name length {}", s.len())));
    }
    let first = s.as_bytes()[0];
    if !(first.is_ascii_alphabetic() || first == b'_' || first == b'.') {
        return Err(Error::Msg(format!("bad LV name '{}'", s)));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-' || b == b'+')
    {
        return Err(Error::Msg(format!("bad LV name '{}'", s)));
    }
    Ok(())
}

/// Apply one op to a metadata value, yielding the successor value.
/// Pure: neither argument is modified. Ops that change nothing return
/// the metadata as-is, without advancing the seqno.
pub fn do_op(meta: &Metadata, op: &Op) -> Result<Metadata> {
    let mut next = meta.clone();

    if !apply(&mut next, op)? {
        return Ok(next);
    }

    next.seqno += 1;
    next.check()?;

    debug!("applied {:?}, seqno now {}", op_name(op), next.seqno);
    Ok(next)
}

fn op_name(op: &Op) -> &'static str {
    match *op {
        Op::LvCreate(_) => "LvCreate",
        Op::LvExpand { .. } => "LvExpand",
        Op::LvReduce { .. } => "LvReduce",
        Op::LvTransfer { .. } => "LvTransfer",
        Op::LvRemove(_) => "LvRemove",
        Op::LvRename { .. } => "LvRename",
        Op::LvAddTag { .. } => "LvAddTag",
        Op::LvRemoveTag { .. } => "LvRemoveTag",
        Op::LvSetStatus { .. } => "LvSetStatus",
    }
}

// Returns whether anything changed.
fn apply(meta: &mut Metadata, op: &Op) -> Result<bool> {
    match *op {
        Op::LvCreate(ref lv) => {
            if meta.lvs.contains_key(&lv.id) {
                return Ok(false);
            }
            lv::segments_well_formed(&lv.name, &lv.segments)?;
            meta.free_space = allocator::sub(&meta.free_space, &lv.to_allocation())?;
            meta.lvs.insert(lv.id, lv.clone());
            Ok(true)
        }

        Op::LvExpand { ref id, ref segments } => {
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;

            let mut changed = false;
            for seg in segments {
                // a segment already present means this record was
                // applied before; don't double-subtract its extents
                if lv.segments.iter().any(|s| s.start_extent == seg.start_extent) {
                    continue;
                }
                meta.free_space = allocator::sub(&meta.free_space, &seg.to_allocation())?;
                lv.segments.push(seg.clone());
                changed = true;
            }

            if changed {
                lv.segments.sort_by_key(|seg| seg.start_extent);
            }
            Ok(changed)
        }

        Op::LvReduce {
            ref id,
            new_extent_count,
        } => {
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;

            if new_extent_count == lv.size_in_extents() {
                return Ok(false);
            }

            let new_segments = lv::reduce_size_to(lv, new_extent_count)?;
            let old_alloc = lv.to_allocation();
            lv.segments = new_segments;
            let freed = allocator::sub(&old_alloc, &lv.to_allocation())?;
            meta.free_space = allocator::merge(&meta.free_space, &freed);
            Ok(true)
        }

        Op::LvTransfer {
            ref src,
            ref dst,
            ref segments,
        } => {
            if src == dst {
                return Err(Error::Msg("cannot transfer an LV's segments to itself".into()));
            }
            let mut src_lv = match meta.lvs.remove(src) {
                Some(x) => x,
                None => return Err(Error::UnknownLv(src.to_string())),
            };
            let mut dst_lv = match meta.lvs.remove(dst) {
                Some(x) => x,
                None => return Err(Error::UnknownLv(dst.to_string())),
            };

            let mut changed = false;
            for seg in segments {
                // physical identity: same backing extents, same length
                let same = |s: &Segment| s.extent_count == seg.extent_count && s.kind == seg.kind;

                if dst_lv.segments.iter().any(|s| same(s)) {
                    continue;
                }
                let pos = src_lv
                    .segments
                    .iter()
                    .position(|s| same(s))
                    .ok_or_else(|| {
                        Error::Msg(format!(
                            "segment at extent {} not present in source LV {}",
                            seg.start_extent, src_lv.name
                        ))
                    })?;

                let mut moved = src_lv.segments.remove(pos);
                moved.start_extent = dst_lv.size_in_extents();
                dst_lv.segments.push(moved);
                changed = true;
            }

            if changed {
                // close the holes left in the source
                let mut next_le = 0;
                for seg in &mut src_lv.segments {
                    seg.start_extent = next_le;
                    next_le += seg.extent_count;
                }
            }

            meta.lvs.insert(src_lv.id, src_lv);
            meta.lvs.insert(dst_lv.id, dst_lv);
            Ok(changed)
        }

        Op::LvRemove(ref id) => match meta.lvs.remove(id) {
            None => Ok(false),
            Some(lv) => {
                meta.free_space = allocator::merge(&meta.free_space, &lv.to_allocation());
                Ok(true)
            }
        },

        Op::LvRename {
            ref id,
            ref new_name,
        } => {
            if meta
                .lvs
                .values()
                .any(|lv| lv.name == *new_name && lv.id != *id)
            {
                return Err(Error::Msg(format!("LV name {} is already in use", new_name)));
            }
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;
            if lv.name == *new_name {
                return Ok(false);
            }
            lv.name = new_name.clone();
            Ok(true)
        }

        Op::LvAddTag { ref id, ref tag } => {
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;
            if lv.has_tag(tag) {
                return Ok(false);
            }
            lv.tags.push(tag.clone());
            Ok(true)
        }

        Op::LvRemoveTag { ref id, ref tag } => {
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;
            let before = lv.tags.len();
            lv.tags.retain(|t| t != tag);
            Ok(lv.tags.len() != before)
        }

        Op::LvSetStatus { ref id, ref status } => {
            let lv = meta
                .lvs
                .get_mut(id)
                .ok_or_else(|| Error::UnknownLv(id.to_string()))?;
            if lv.status == *status {
                return Ok(false);
            }
            lv.status = status.clone();
            Ok(true)
        }
    }
}

/// Emit the metadata in LVM2 text form, with the keys in the order the
/// stock tools write them.
pub fn to_text(meta: &Metadata) -> Vec<u8> {
    let mut out = String::new();

    writeln!(out, "{} {{", meta.name).unwrap();
    writeln!(out, "id = \"{}\"", meta.id).unwrap();
    writeln!(out, "seqno = {}", meta.seqno).unwrap();
    let status: Vec<_> = meta
        .status
        .iter()
        .map(|x| format!("\"{}\"", x.as_str()))
        .collect();
    writeln!(out, "status = [{}]", status.join(", ")).unwrap();
    writeln!(out, "extent_size = {}", meta.extent_size).unwrap();
    writeln!(out, "max_lv = {}", meta.max_lv).unwrap();
    writeln!(out, "max_pv = {}", meta.max_pv).unwrap();

    writeln!(out, "physical_volumes {{").unwrap();
    for pv in &meta.pvs {
        pv.to_text(&mut out);
    }
    writeln!(out, "}}").unwrap();

    if !meta.lvs.is_empty() {
        writeln!(out, "logical_volumes {{").unwrap();
        let mut lvs: Vec<_> = meta.lvs.values().collect();
        lvs.sort_by(|a, b| a.name.cmp(&b.name));
        for lv in lvs {
            lv.to_text(&mut out);
        }
        writeln!(out, "}}").unwrap();
    }

    writeln!(out, "}}").unwrap();

    writeln!(
        out,
        "# Generated by MLVM version 0.1: {} {}",
        meta.creation_host, meta.creation_time
    )
    .unwrap();
    writeln!(out, "contents = \"Text Format Volume Group\"").unwrap();
    writeln!(out, "version = 1").unwrap();
    writeln!(out, "description = \"\"").unwrap();
    writeln!(out, "creation_host = \"{}\"", escaped(&meta.creation_host)).unwrap();
    writeln!(out, "creation_time = {}", meta.creation_time).unwrap();

    out.into_bytes()
}

/// Parse metadata text, attaching the label each PV entry was read
/// with, and rebuild the free space from what the LVs leave unused.
pub fn from_buf(buf: &[u8], labels: &BTreeMap<Uuid, PvLabel>) -> Result<Metadata> {
    let map = buf_to_textmap(buf)?;

    // the single nested textmap at the top level is the VG
    let (name, vg_map) = map
        .iter()
        .find_map(|(k, v)| match *v {
            Entry::TextMap(ref tm) => Some((k.as_str(), tm.as_ref())),
            _ => None,
        })
        .ok_or_else(|| Error::Msg("no volume group in metadata".into()))?;

    let creation_host = map
        .string_from_textmap("creation_host")
        .ok_or_else(|| parse_err("metadata", "creation_host"))?;
    let creation_time = map
        .i64_from_textmap("creation_time")
        .ok_or_else(|| parse_err("metadata", "creation_time"))?;

    let id = vg_map
        .string_from_textmap("id")
        .ok_or_else(|| parse_err(name, "id"))?;
    let seqno = vg_map
        .i64_from_textmap("seqno")
        .ok_or_else(|| parse_err(name, "seqno"))?;
    let extent_size = vg_map
        .i64_from_textmap("extent_size")
        .ok_or_else(|| parse_err(name, "extent_size"))?;
    let max_lv = vg_map
        .i64_from_textmap("max_lv")
        .ok_or_else(|| parse_err(name, "max_lv"))?;
    let max_pv = vg_map
        .i64_from_textmap("max_pv")
        .ok_or_else(|| parse_err(name, "max_pv"))?;

    if extent_size <= 0 {
        return Err(Error::Msg(format!("{}: bad extent_size {}", name, extent_size)));
    }

    let status = status_from_textmap(vg_map, name)?
        .iter()
        .map(|s| VgStatus::of_string(s))
        .collect::<Result<Vec<_>>>()?;

    let pv_maps = vg_map
        .textmap_from_textmap("physical_volumes")
        .ok_or_else(|| parse_err(name, "physical_volumes"))?;

    let mut pvs = Vec::new();
    for (pv_name, value) in pv_maps {
        let pv_map = match *value {
            Entry::TextMap(ref tm) => tm,
            _ => return Err(parse_err("physical_volumes", pv_name)),
        };
        let pv_id = pv_map
            .string_from_textmap("id")
            .ok_or_else(|| parse_err(pv_name, "id"))
            .and_then(|s| Uuid::of_string(s))?;
        let label = labels
            .get(&pv_id)
            .ok_or_else(|| Error::Msg(format!("pv {}: no device with uuid {}", pv_name, pv_id)))?;
        pvs.push(Pv::from_textmap(pv_name, pv_map, label.clone())?);
    }

    let mut lvs: BTreeMap<Uuid, Lv> = BTreeMap::new();
    if let Some(lv_maps) = vg_map.textmap_from_textmap("logical_volumes") {
        for (lv_name, value) in lv_maps {
            let lv_map = match *value {
                Entry::TextMap(ref tm) => tm,
                _ => return Err(parse_err("logical_volumes", lv_name)),
            };
            let parsed = Lv::from_textmap(lv_name, lv_map)?;
            if lvs.insert(parsed.id, parsed).is_some() {
                return Err(Error::Msg(format!(
                    "logical_volumes/{}: duplicate LV id",
                    lv_name
                )));
            }
        }
    }

    let mut meta = Metadata {
        name: name.to_string(),
        id: Uuid::of_string(id)?,
        creation_host: creation_host.to_string(),
        creation_time,
        seqno: seqno as u32,
        status,
        extent_size: extent_size as u64,
        max_lv: max_lv as u64,
        max_pv: max_pv as u64,
        pvs,
        lvs,
        free_space: Allocation::default(),
    };

    // free space is whatever the LVs don't cover
    let used = meta.lvs.values().fold(Allocation::default(), |acc, lv| {
        allocator::merge(&acc, &lv.to_allocation())
    });
    meta.free_space = allocator::sub(&meta.full_extents(), &used)?;

    meta.check()?;
    Ok(meta)
}
