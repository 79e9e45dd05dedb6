// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical Volumes and their segment maps.

use std::fmt;
use std::fmt::Write;

use crate::allocator::{Allocation, ExtentInterval};
use crate::parser::{parse_err, Entry, LvmTextMap, TextMapOps};
use crate::pv::{status_from_textmap, PvName, MAX_NAME_LEN};
use crate::uuid::Uuid;
use crate::{Error, Result};

/// LV status flags.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum LvStatus {
    Read,
    Write,
    Visible,
}

impl LvStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            LvStatus::Read => "READ",
            LvStatus::Write => "WRITE",
            LvStatus::Visible => "VISIBLE",
        }
    }

    pub fn of_string(s: &str) -> Result<LvStatus> {
        match s {
            "READ" => Ok(LvStatus::Read),
            "WRITE" => Ok(LvStatus::Write),
            "VISIBLE" => Ok(LvStatus::Visible),
            _ => Err(Error::Msg(format!("unknown LV status {}", s))),
        }
    }
}

/// A tag attached to an LV.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct Tag(String);

impl Tag {
    pub fn of_string(s: &str) -> Result<Tag> {
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(Error::Msg(format!("bad tag length {}", s.len())));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-' || b == b'+')
        {
            return Err(Error::Msg(format!("bad tag '{}'", s)));
        }
        Ok(Tag(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a linear segment's extents live.
#[derive(Debug, PartialEq, Clone)]
pub struct LinearSegment {
    pub pv_name: PvName,
    pub pv_start_extent: u64,
}

#[derive(Debug, PartialEq, Clone)]
pub enum SegmentKind {
    Linear(LinearSegment),
    /// Parsed and re-emitted, but not supported for I/O.
    Striped {
        stripe_size: Option<u64>,
        stripes: Vec<(PvName, u64)>,
    },
}

/// A run of logical extents mapped onto physical extents.
#[derive(Debug, PartialEq, Clone)]
pub struct Segment {
    /// The first extent within the LV this segment comprises.
    pub start_extent: u64,
    /// How many extents this segment comprises.
    pub extent_count: u64,
    pub kind: SegmentKind,
}

impl Segment {
    fn end(&self) -> u64 {
        self.start_extent + self.extent_count
    }

    /// The physical extents backing this segment.
    pub fn to_allocation(&self) -> Allocation {
        match self.kind {
            SegmentKind::Linear(ref lin) => Allocation::from_entries(vec![(
                lin.pv_name.clone(),
                ExtentInterval {
                    start: lin.pv_start_extent,
                    count: self.extent_count,
                },
            )]),
            SegmentKind::Striped { ref stripes, .. } => {
                // each stripe holds an equal share, rounded up
                let per_stripe =
                    (self.extent_count + stripes.len() as u64 - 1) / stripes.len() as u64;
                Allocation::from_entries(
                    stripes
                        .iter()
                        .map(|(name, offset)| {
                            (
                                name.clone(),
                                ExtentInterval {
                                    start: *offset,
                                    count: per_stripe,
                                },
                            )
                        })
                        .collect(),
                )
            }
        }
    }

    fn to_text(&self, n: usize, out: &mut String) {
        writeln!(out, "segment{} {{", n).unwrap();
        writeln!(out, "start_extent = {}", self.start_extent).unwrap();
        writeln!(out, "extent_count = {}", self.extent_count).unwrap();
        writeln!(out, "type = \"striped\"").unwrap();
        match self.kind {
            SegmentKind::Linear(ref lin) => {
                writeln!(out, "stripe_count = 1").unwrap();
                writeln!(out, "stripes = [").unwrap();
                writeln!(out, "\"{}\", {}", lin.pv_name, lin.pv_start_extent).unwrap();
                writeln!(out, "]").unwrap();
            }
            SegmentKind::Striped {
                stripe_size,
                ref stripes,
            } => {
                writeln!(out, "stripe_count = {}", stripes.len()).unwrap();
                if let Some(size) = stripe_size {
                    writeln!(out, "stripe_size = {}", size).unwrap();
                }
                writeln!(out, "stripes = [").unwrap();
                for (name, offset) in stripes {
                    writeln!(out, "\"{}\", {}", name, offset).unwrap();
                }
                writeln!(out, "]").unwrap();
            }
        }
        writeln!(out, "}}").unwrap();
    }

    fn from_textmap(path: &str, map: &LvmTextMap) -> Result<Segment> {
        let start_extent = map
            .i64_from_textmap("start_extent")
            .ok_or_else(|| parse_err(path, "start_extent"))?;
        let extent_count = map
            .i64_from_textmap("extent_count")
            .ok_or_else(|| parse_err(path, "extent_count"))?;
        let ty = map
            .string_from_textmap("type")
            .ok_or_else(|| parse_err(path, "type"))?;

        if ty != "striped" {
            return Err(Error::Msg(format!("{}: unsupported segment type {}", path, ty)));
        }

        let stripe_list = map
            .list_from_textmap("stripes")
            .ok_or_else(|| parse_err(path, "stripes"))?;

        let mut stripes: Vec<(PvName, u64)> = Vec::new();
        for slc in stripe_list.chunks(2) {
            let name = match slc.get(0) {
                Some(&Entry::String(ref x)) => PvName::of_string(x)?,
                _ => return Err(parse_err(path, "stripes")),
            };
            let offset = match slc.get(1) {
                Some(&Entry::Number(x)) => x as u64,
                _ => return Err(parse_err(path, "stripes")),
            };
            stripes.push((name, offset));
        }

        let kind = if stripes.len() == 1 {
            let (pv_name, pv_start_extent) = stripes.into_iter().next().unwrap();
            SegmentKind::Linear(LinearSegment {
                pv_name,
                pv_start_extent,
            })
        } else if stripes.is_empty() {
            return Err(parse_err(path, "stripes"));
        } else {
            SegmentKind::Striped {
                stripe_size: map.i64_from_textmap("stripe_size").map(|x| x as u64),
                stripes,
            }
        };

        Ok(Segment {
            start_extent: start_extent as u64,
            extent_count: extent_count as u64,
            kind,
        })
    }
}

/// A Logical Volume.
#[derive(Debug, PartialEq, Clone)]
pub struct Lv {
    /// The UUID, unique within the VG.
    pub id: Uuid,
    /// The name, unique within the VG.
    pub name: String,
    pub tags: Vec<Tag>,
    pub status: Vec<LvStatus>,
    /// Created by this host.
    pub creation_host: String,
    /// Created at this Unix time.
    pub creation_time: i64,
    /// Sorted by start_extent, gapless from 0.
    pub segments: Vec<Segment>,
}

impl Lv {
    /// The total number of extents used by this logical volume.
    pub fn size_in_extents(&self) -> u64 {
        self.segments.iter().map(|x| x.extent_count).sum()
    }

    /// The physical extents backing the whole LV.
    pub fn to_allocation(&self) -> Allocation {
        self.segments.iter().fold(Allocation::default(), |acc, seg| {
            crate::allocator::merge(&acc, &seg.to_allocation())
        })
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_writable(&self) -> bool {
        self.status.contains(&LvStatus::Write)
    }

    pub fn to_text(&self, out: &mut String) {
        writeln!(out, "{} {{", self.name).unwrap();
        writeln!(out, "id = \"{}\"", self.id).unwrap();
        let status: Vec<_> = self
            .status
            .iter()
            .map(|x| format!("\"{}\"", x.as_str()))
            .collect();
        writeln!(out, "status = [{}]", status.join(", ")).unwrap();
        if !self.tags.is_empty() {
            let tags: Vec<_> = self.tags.iter().map(|x| format!("\"{}\"", x)).collect();
            writeln!(out, "tags = [{}]", tags.join(", ")).unwrap();
        }
        writeln!(out, "creation_host = \"{}\"", crate::parser::escaped(&self.creation_host))
            .unwrap();
        writeln!(out, "creation_time = {}", self.creation_time).unwrap();
        writeln!(out, "segment_count = {}", self.segments.len()).unwrap();
        for (i, seg) in self.segments.iter().enumerate() {
            seg.to_text(i + 1, out);
        }
        writeln!(out, "}}").unwrap();
    }

    pub fn from_textmap(name: &str, map: &LvmTextMap) -> Result<Lv> {
        let path = format!("logical_volumes/{}", name);

        let id = map
            .string_from_textmap("id")
            .ok_or_else(|| parse_err(&path, "id"))?;
        let creation_host = map
            .string_from_textmap("creation_host")
            .ok_or_else(|| parse_err(&path, "creation_host"))?;
        let creation_time = map
            .i64_from_textmap("creation_time")
            .ok_or_else(|| parse_err(&path, "creation_time"))?;
        let segment_count = map
            .i64_from_textmap("segment_count")
            .ok_or_else(|| parse_err(&path, "segment_count"))?;

        let status = status_from_textmap(map, &path)?
            .iter()
            .map(|s| LvStatus::of_string(s))
            .collect::<Result<Vec<_>>>()?;

        let tags = match map.list_from_textmap("tags") {
            Some(list) => list
                .iter()
                .filter_map(|item| match *item {
                    Entry::String(ref x) => Some(Tag::of_string(x)),
                    _ => None,
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let mut segments = Vec::new();
        for i in 0..segment_count {
            let seg_name = format!("segment{}", i + 1);
            let seg_path = format!("{}/{}", path, seg_name);
            let seg_map = map
                .textmap_from_textmap(&seg_name)
                .ok_or_else(|| parse_err(&path, &seg_name))?;
            segments.push(Segment::from_textmap(&seg_path, seg_map)?);
        }
        segments.sort_by_key(|seg| seg.start_extent);
        segments_well_formed(&path, &segments)?;

        Ok(Lv {
            id: Uuid::of_string(id)?,
            name: name.to_string(),
            tags,
            status,
            creation_host: creation_host.to_string(),
            creation_time,
            segments,
        })
    }
}

/// Find the segment containing logical extent `le`. Binary search over
/// the sorted segment list.
pub fn find_extent(lv: &Lv, le: u64) -> Option<&Segment> {
    let idx = lv.segments.partition_point(|seg| seg.start_extent <= le);
    if idx == 0 {
        return None;
    }
    let seg = &lv.segments[idx - 1];
    if le < seg.end() {
        Some(seg)
    } else {
        None
    }
}

/// Truncate a segment list to `new_count` extents, shortening the last
/// retained segment to fit.
pub fn reduce_size_to(lv: &Lv, new_count: u64) -> Result<Vec<Segment>> {
    let current = lv.size_in_extents();
    if new_count > current {
        return Err(Error::Msg(format!(
            "cannot reduce {} to {} extents, only {} allocated",
            lv.name, new_count, current
        )));
    }

    let mut out = Vec::new();
    for seg in &lv.segments {
        if seg.start_extent >= new_count {
            break;
        }
        let mut seg = seg.clone();
        if seg.end() > new_count {
            seg.extent_count = new_count - seg.start_extent;
        }
        out.push(seg);
    }

    Ok(out)
}

/// Turn an allocation into linear segments starting at logical extent
/// `start_le`, one segment per physical run.
pub fn linear(start_le: u64, allocation: &Allocation) -> Vec<Segment> {
    let mut next_le = start_le;
    allocation
        .entries()
        .iter()
        .map(|(name, ival)| {
            let seg = Segment {
                start_extent: next_le,
                extent_count: ival.count,
                kind: SegmentKind::Linear(LinearSegment {
                    pv_name: name.clone(),
                    pv_start_extent: ival.start,
                }),
            };
            next_le += ival.count;
            seg
        })
        .collect()
}

/// Check that segments are sorted, start at extent 0, and have no gaps
/// or overlaps.
pub fn segments_well_formed(what: &str, segments: &[Segment]) -> Result<()> {
    let mut expected = 0;
    for seg in segments {
        if seg.start_extent != expected {
            return Err(Error::Msg(format!(
                "{}: segment list has a gap or overlap at extent {}",
                what, seg.start_extent
            )));
        }
        if seg.extent_count == 0 {
            return Err(Error::Msg(format!("{}: empty segment", what)));
        }
        expected = seg.end();
    }
    Ok(())
}
