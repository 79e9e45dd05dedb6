// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tracking physical extents.
//!
//! An [`Allocation`] is an ordered list of extent runs keyed by PV
//! name. The VG keeps its free space in one; each LV's segments reduce
//! to one. The list is kept canonical: runs for the same PV are
//! adjacent (grouped in first-appearance order, which is the VG's PV
//! order), sorted by start, coalesced, and never empty.

use crate::pv::PvName;
use crate::{Error, Result};

/// A contiguous run of physical extents.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExtentInterval {
    pub start: u64,
    pub count: u64,
}

impl ExtentInterval {
    fn end(&self) -> u64 {
        self.start + self.count
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Allocation(Vec<(PvName, ExtentInterval)>);

impl Allocation {
    /// An allocation covering extents `[0, pe_count)` of one PV.
    pub fn create(name: &PvName, pe_count: u64) -> Allocation {
        if pe_count == 0 {
            return Allocation(Vec::new());
        }
        Allocation(vec![(
            name.clone(),
            ExtentInterval {
                start: 0,
                count: pe_count,
            },
        )])
    }

    /// An allocation from arbitrary runs, canonicalized.
    pub fn from_entries(entries: Vec<(PvName, ExtentInterval)>) -> Allocation {
        canonicalize(entries)
    }

    pub fn entries(&self) -> &[(PvName, ExtentInterval)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of extents covered.
    pub fn size(&self) -> u64 {
        self.0.iter().map(|&(_, ival)| ival.count).sum()
    }

    /// Entries sorted by PV name and start, for order-insensitive
    /// comparison of two allocations.
    pub fn sorted_entries(&self) -> Vec<(PvName, ExtentInterval)> {
        let mut entries = self.0.clone();
        entries.sort_by(|(an, ai), (bn, bi)| an.cmp(bn).then(ai.start.cmp(&bi.start)));
        entries
    }
}

// Rebuild an entry list in canonical form: group runs by PV in
// first-appearance order, sort each group by start, merge overlapping
// or adjacent runs, drop empties.
fn canonicalize(entries: Vec<(PvName, ExtentInterval)>) -> Allocation {
    let mut groups: Vec<(PvName, Vec<ExtentInterval>)> = Vec::new();

    for (name, ival) in entries {
        if ival.count == 0 {
            continue;
        }
        match groups.iter_mut().find(|(n, _)| *n == name) {
            Some((_, ivals)) => ivals.push(ival),
            None => groups.push((name, vec![ival])),
        }
    }

    let mut out = Vec::new();
    for (name, mut ivals) in groups {
        ivals.sort_by_key(|ival| ival.start);

        let mut merged: Vec<ExtentInterval> = Vec::new();
        for ival in ivals {
            match merged.last_mut() {
                Some(last) if ival.start <= last.end() => {
                    let end = std::cmp::max(last.end(), ival.end());
                    last.count = end - last.start;
                }
                _ => merged.push(ival),
            }
        }

        out.extend(merged.into_iter().map(|ival| (name.clone(), ival)));
    }

    Allocation(out)
}

/// The union of two allocations, canonical.
pub fn merge(a: &Allocation, b: &Allocation) -> Allocation {
    let mut entries = a.0.clone();
    entries.extend(b.0.iter().cloned());
    canonicalize(entries)
}

/// `a \ b`. `b` must be wholly contained in `a`; a run of `b` not
/// covered by `a` is an internal accounting error and fails fast.
pub fn sub(a: &Allocation, b: &Allocation) -> Result<Allocation> {
    let mut out: Vec<(PvName, ExtentInterval)> = a.0.clone();

    for (name, cut) in &b.0 {
        let pos = out
            .iter()
            .position(|(n, ival)| n == name && ival.start <= cut.start && cut.end() <= ival.end())
            .ok_or_else(|| {
                Error::Msg(format!(
                    "extent accounting error: {}:[{}, {}) is not allocated",
                    name,
                    cut.start,
                    cut.end()
                ))
            })?;

        let (_, ival) = out.remove(pos);
        let mut replace = Vec::new();
        if ival.start < cut.start {
            replace.push((
                name.clone(),
                ExtentInterval {
                    start: ival.start,
                    count: cut.start - ival.start,
                },
            ));
        }
        if cut.end() < ival.end() {
            replace.push((
                name.clone(),
                ExtentInterval {
                    start: cut.end(),
                    count: ival.end() - cut.end(),
                },
            ));
        }
        // splice back in place to preserve PV ordering
        for (i, entry) in replace.into_iter().enumerate() {
            out.insert(pos + i, entry);
        }
    }

    Ok(canonicalize(out))
}

/// Gather `n` extents from `free`, first-fit in entry order (the VG's
/// PV order). `free` is not modified; the caller subtracts the result.
pub fn find(free: &Allocation, n: u64) -> Result<Allocation> {
    let available = free.size();
    if available < n {
        return Err(Error::OnlyThisMuchFree {
            needed: n,
            available,
        });
    }

    let mut remaining = n;
    let mut chosen = Vec::new();

    for (name, ival) in &free.0 {
        if remaining == 0 {
            break;
        }
        let take = std::cmp::min(remaining, ival.count);
        chosen.push((
            name.clone(),
            ExtentInterval {
                start: ival.start,
                count: take,
            },
        ));
        remaining -= take;
    }

    Ok(Allocation(chosen))
}
