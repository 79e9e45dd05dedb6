// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading and writing LVM on-disk labels and metadata.

//
// label is at start of sectors 0-3, usually 1
// label includes offset of pvheader (also within 1st 4 sectors)
// pvheader includes ptrs to data (1) and metadata (0-2) areas
// metadata area (MDA), located anywhere, starts with 512b mda header,
//   then large text area
// mda header has 40b of stuff, then rlocns[].
// rlocns point into mda text area. rlocn 0 is the current text
//   metadata, rlocn 1 the previous write, kept so readers can fall
//   back after a torn write.
// text metadata written aligned to sector-size; text area treated as
//   circular and text may wrap across end to beginning
// text metadata contains vg metadata in lvm config text format. Each
//   write increments seqno.
//

use std::cmp::min;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::block::{BlockDev, SECTOR_SIZE};
use crate::util::{align_to, crc32_calc};
use crate::uuid::Uuid;
use crate::{Error, Result};

const LABEL_SCAN_SECTORS: usize = 4;
const ID_LEN: usize = 32;
const MDA_MAGIC: &[u8] = b"\x20\x4c\x56\x4d\x32\x20\x78\x5b\x35\x41\x25\x72\x30\x4e\x2a\x3e";
const LABEL_SIZE: usize = 32;
const LABEL_SECTOR: usize = 1;
const MDA_HEADER_SIZE: usize = 512;
const EXTENSION_VERSION: u32 = 1;

/// Largest metadata area carved out when formatting, in bytes.
pub const MAX_METADATA_SIZE: u64 = 1024 * 1024;

const RLOCN_IGNORED: u32 = 1;
const RLOCN_JOURNALLED: u32 = 2;

/// VG layout discriminator: stock LVM2, or LVM2 plus a dedicated
/// redo-log LV. Carried in the raw_locn flags of every metadata area.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Magic {
    Lvm,
    Journalled,
}

/// Describes an area within a PV
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PvArea {
    /// The offset from the start of the device in bytes
    pub offset: u64,
    /// The size in bytes
    pub size: u64,
}

#[derive(Debug)]
struct PvAreaIter<'a> {
    area: &'a [u8],
}

fn iter_pv_area(buf: &[u8]) -> PvAreaIter {
    PvAreaIter { area: buf }
}

impl<'a> Iterator for PvAreaIter<'a> {
    type Item = PvArea;

    fn next(&mut self) -> Option<PvArea> {
        let off = LittleEndian::read_u64(&self.area[..8]);
        let size = LittleEndian::read_u64(&self.area[8..16]);

        if off == 0 {
            None
        } else {
            self.area = &self.area[16..];
            Some(PvArea { offset: off, size })
        }
    }
}

/// One slot of the mda header's location list, pointing at a write of
/// the text metadata within the circular buffer.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct RawLocn {
    /// Offset of the text from the start of the metadata area, bytes.
    pub offset: u64,
    /// Length of the text in bytes.
    pub size: u64,
    /// CRC over the text.
    pub checksum: u32,
    pub flags: u32,
}

impl RawLocn {
    pub fn ignored(&self) -> bool {
        self.flags & RLOCN_IGNORED != 0
    }

    pub fn journalled(&self) -> bool {
        self.flags & RLOCN_JOURNALLED != 0
    }
}

#[derive(Debug)]
struct RawLocnIter<'a> {
    area: &'a [u8],
}

fn iter_raw_locn(buf: &[u8]) -> RawLocnIter {
    RawLocnIter { area: buf }
}

impl<'a> Iterator for RawLocnIter<'a> {
    type Item = RawLocn;

    fn next(&mut self) -> Option<RawLocn> {
        let off = LittleEndian::read_u64(&self.area[..8]);
        let size = LittleEndian::read_u64(&self.area[8..16]);
        let checksum = LittleEndian::read_u32(&self.area[16..20]);
        let flags = LittleEndian::read_u32(&self.area[20..24]);

        if off == 0 {
            None
        } else {
            self.area = &self.area[24..];
            Some(RawLocn {
                offset: off,
                size,
                checksum,
                flags,
            })
        }
    }
}

/// The 512-byte header fronting a metadata area's circular buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct MdaHeader {
    /// Byte offset of the whole area on the device.
    pub start: u64,
    /// Byte length of the whole area, header included.
    pub size: u64,
    /// Newest location first; at most the two most recent are kept.
    pub raw_locns: Vec<RawLocn>,
}

/// A device's LABELONE block and PV header, parsed.
#[derive(Debug, PartialEq, Clone)]
pub struct PvLabel {
    /// The unique identifier.
    pub id: Uuid,
    /// Size in bytes of the entire PV.
    pub device_size: u64,
    /// A list of the data areas.
    pub data_areas: Vec<PvArea>,
    /// A list of the metadata areas.
    pub metadata_areas: Vec<PvArea>,
}

/// Read sectors 0-3 and parse the LABELONE block and the pv_header it
/// points at.
pub fn read_label(dev: &dyn BlockDev) -> Result<PvLabel> {
    let mut buf = [0u8; LABEL_SCAN_SECTORS * SECTOR_SIZE];
    dev.read_at(0, &mut buf)?;

    for x in 0..LABEL_SCAN_SECTORS {
        let sec_buf = &buf[x * SECTOR_SIZE..(x + 1) * SECTOR_SIZE];
        if &sec_buf[..8] != b"LABELONE" {
            continue;
        }

        let crc = LittleEndian::read_u32(&sec_buf[16..20]);
        if crc != crc32_calc(&sec_buf[20..SECTOR_SIZE]) {
            return Err(Error::Msg("corrupt metadata: label checksum".into()));
        }

        let sector = LittleEndian::read_u64(&sec_buf[8..16]);
        if sector != x as u64 {
            return Err(Error::Msg("corrupt metadata: label sector field".into()));
        }

        // offset is relative to the label's own sector
        let offset = LittleEndian::read_u32(&sec_buf[20..24]) as usize + x * SECTOR_SIZE;
        return parse_pv_header(&buf[offset..]);
    }

    Err(Error::Msg("not an LVM PV".into()))
}

//
// PV HEADER LAYOUT:
// - static header (uuid and size)
// - 0+ data areas (actually max 1, usually 1; size 0 == "rest of blkdev")
// - blank entry
// - 0+ metadata areas (max 2, usually 1)
// - blank entry
// - 8 bytes of pvextension header
//
fn parse_pv_header(buf: &[u8]) -> Result<PvLabel> {
    let id = Uuid::from_bytes(&buf[..ID_LEN])?;
    let device_size = LittleEndian::read_u64(&buf[ID_LEN..ID_LEN + 8]);

    let mut da_buf = &buf[ID_LEN + 8..];
    let da_vec: Vec<_> = iter_pv_area(da_buf).collect();

    // move slice past any actual entries plus blank terminating entry
    da_buf = &da_buf[(da_vec.len() + 1) * 16..];

    let md_vec: Vec<_> = iter_pv_area(da_buf).collect();

    Ok(PvLabel {
        id,
        device_size,
        data_areas: da_vec,
        metadata_areas: md_vec,
    })
}

/// Stamp a label sector for the given PV layout.
pub fn write_label(dev: &dyn BlockDev, label: &PvLabel) -> Result<()> {
    let mut sec_buf = [0u8; SECTOR_SIZE];

    let mut off = LABEL_SIZE;
    sec_buf[off..off + ID_LEN].copy_from_slice(label.id.as_bytes());
    off += ID_LEN;

    LittleEndian::write_u64(&mut sec_buf[off..off + 8], label.device_size);
    off += 8;

    for area in &label.data_areas {
        LittleEndian::write_u64(&mut sec_buf[off..off + 8], area.offset);
        LittleEndian::write_u64(&mut sec_buf[off + 8..off + 16], area.size);
        off += 16;
    }
    // blank entry ends the da list
    off += 16;

    for area in &label.metadata_areas {
        LittleEndian::write_u64(&mut sec_buf[off..off + 8], area.offset);
        LittleEndian::write_u64(&mut sec_buf[off + 8..off + 16], area.size);
        off += 16;
    }
    // blank entry ends the mda list
    off += 16;

    // extension header; no bootloader areas
    LittleEndian::write_u32(&mut sec_buf[off..off + 4], EXTENSION_VERSION);

    // Must do the label header last since it crcs over everything
    sec_buf[..8].copy_from_slice(b"LABELONE");
    LittleEndian::write_u64(&mut sec_buf[8..16], LABEL_SECTOR as u64);
    LittleEndian::write_u32(&mut sec_buf[20..24], LABEL_SIZE as u32);
    sec_buf[24..32].copy_from_slice(b"LVM2 001");
    let crc_val = crc32_calc(&sec_buf[20..]);
    LittleEndian::write_u32(&mut sec_buf[16..20], crc_val);

    dev.write_at((LABEL_SECTOR * SECTOR_SIZE) as u64, &sec_buf)?;
    dev.sync()
}

/// Read and verify the 512-byte header of one metadata area.
pub fn read_mda_header(dev: &dyn BlockDev, area: &PvArea) -> Result<MdaHeader> {
    if area.size as usize <= MDA_HEADER_SIZE {
        return Err(Error::Msg("metadata area too small".into()));
    }

    let mut hdr = [0u8; MDA_HEADER_SIZE];
    dev.read_at(area.offset, &mut hdr)?;

    if LittleEndian::read_u32(&hdr[..4]) != crc32_calc(&hdr[4..MDA_HEADER_SIZE]) {
        return Err(Error::Msg("corrupt metadata: mda header checksum".into()));
    }

    if &hdr[4..20] != MDA_MAGIC {
        return Err(Error::Msg("not an LVM PV".into()));
    }

    let ver = LittleEndian::read_u32(&hdr[20..24]);
    if ver != 1 {
        return Err(Error::Msg(format!("bad mda version {}, expected 1", ver)));
    }

    let start = LittleEndian::read_u64(&hdr[24..32]);
    if start != area.offset {
        return Err(Error::Msg(format!(
            "mdah start {} does not equal pvarea start {}",
            start, area.offset
        )));
    }

    let size = LittleEndian::read_u64(&hdr[32..40]);
    if size != area.size {
        return Err(Error::Msg(format!(
            "mdah size {} does not equal pvarea size {}",
            size, area.size
        )));
    }

    Ok(MdaHeader {
        start,
        size,
        raw_locns: iter_raw_locn(&hdr[40..]).take(2).collect(),
    })
}

/// Write one metadata area's header sector.
pub fn write_mda_header(dev: &dyn BlockDev, hdr: &MdaHeader) -> Result<()> {
    let mut buf = [0u8; MDA_HEADER_SIZE];

    buf[4..20].copy_from_slice(MDA_MAGIC);
    LittleEndian::write_u32(&mut buf[20..24], 1);
    LittleEndian::write_u64(&mut buf[24..32], hdr.start);
    LittleEndian::write_u64(&mut buf[32..40], hdr.size);

    let mut off = 40;
    for rl in hdr.raw_locns.iter().take(2) {
        LittleEndian::write_u64(&mut buf[off..off + 8], rl.offset);
        LittleEndian::write_u64(&mut buf[off + 8..off + 16], rl.size);
        LittleEndian::write_u32(&mut buf[off + 16..off + 20], rl.checksum);
        LittleEndian::write_u32(&mut buf[off + 20..off + 24], rl.flags);
        off += 24;
    }

    let csum = crc32_calc(&buf[4..]);
    LittleEndian::write_u32(&mut buf[..4], csum);

    dev.write_at(hdr.start, &buf)?;
    Ok(())
}

/// Which layout the metadata areas advertise.
pub fn read_magic(dev: &dyn BlockDev, label: &PvLabel) -> Result<Magic> {
    for area in &label.metadata_areas {
        let hdr = read_mda_header(dev, area)?;
        if let Some(rl) = hdr.raw_locns.first() {
            if rl.journalled() {
                return Ok(Magic::Journalled);
            }
        }
    }
    Ok(Magic::Lvm)
}

// Read `size` bytes out of the circular text buffer starting at
// `offset` from the area start, wrapping past the end of the area to
// just after the header.
fn read_circular(dev: &dyn BlockDev, area: &PvArea, offset: u64, size: u64) -> Result<Vec<u8>> {
    let mut text = vec![0; size as usize];
    let first_read = min(area.size - offset, size) as usize;

    dev.read_at(area.offset + offset, &mut text[..first_read])?;

    if first_read != size as usize {
        dev.read_at(
            area.offset + MDA_HEADER_SIZE as u64,
            &mut text[first_read..],
        )?;
    }

    Ok(text)
}

/// Read the newest valid metadata text in the PV's metadata areas.
/// Falls back to the previous write if the newest fails its checksum.
pub fn read_metadata(dev: &dyn BlockDev, label: &PvLabel) -> Result<Vec<u8>> {
    let mut saw_candidate = false;

    for area in &label.metadata_areas {
        let hdr = read_mda_header(dev, area)?;

        for rl in &hdr.raw_locns {
            if rl.ignored() || rl.size == 0 {
                continue;
            }
            saw_candidate = true;

            let text = read_circular(dev, area, rl.offset, rl.size)?;
            if rl.checksum == crc32_calc(&text) {
                return Ok(text);
            }
            warn!(
                "metadata at area {:#x} offset {:#x} fails its checksum, trying older",
                area.offset, rl.offset
            );
        }
    }

    if saw_candidate {
        Err(Error::Msg("corrupt metadata".into()))
    } else {
        Err(Error::Msg("no metadata found".into()))
    }
}

/// Append metadata text to the circular buffer of every active
/// metadata area, then swing the header to it. The previous location
/// is retained so a torn write cannot strand readers.
pub fn write_metadata(
    dev: &dyn BlockDev,
    label: &PvLabel,
    text: &[u8],
    magic: Magic,
) -> Result<()> {
    for area in &label.metadata_areas {
        if text.len() as u64 + MDA_HEADER_SIZE as u64 > area.size {
            return Err(Error::Msg("metadata too large".into()));
        }

        let mut hdr = read_mda_header(dev, area)?;

        let prev = hdr.raw_locns.first().copied();
        if let Some(rl) = prev {
            if rl.ignored() {
                continue;
            }
        }

        // next write begins at the first sector past the previous text,
        // skipping the header sector when it wraps
        let start_off = match prev {
            Some(rl) => {
                let next = align_to((rl.offset + rl.size) as usize, SECTOR_SIZE) as u64 % area.size;
                if next < MDA_HEADER_SIZE as u64 {
                    MDA_HEADER_SIZE as u64
                } else {
                    next
                }
            }
            None => MDA_HEADER_SIZE as u64,
        };
        debug_assert_eq!(start_off % SECTOR_SIZE as u64, 0);

        let tail_space = min(area.size - start_off, text.len() as u64) as usize;
        if tail_space > 0 {
            dev.write_at(area.offset + start_off, &text[..tail_space])?;
        }
        if tail_space != text.len() {
            dev.write_at(area.offset + MDA_HEADER_SIZE as u64, &text[tail_space..])?;
        }

        // text durable before the header points at it
        dev.sync()?;

        let mut flags = 0;
        if magic == Magic::Journalled {
            flags |= RLOCN_JOURNALLED;
        }
        let new_rl = RawLocn {
            offset: start_off,
            size: text.len() as u64,
            checksum: crc32_calc(text),
            flags,
        };

        let mut raw_locns = vec![new_rl];
        raw_locns.extend(prev);
        hdr.raw_locns = raw_locns;

        write_mda_header(dev, &hdr)?;
        dev.sync()?;

        debug!(
            "wrote {} bytes of metadata at area {:#x} offset {:#x}",
            text.len(),
            area.offset,
            start_off
        );
    }

    Ok(())
}

/// Initialize a device as a PV: two metadata areas of
/// [`MAX_METADATA_SIZE`], a data area between them, and a fresh label.
pub fn format(dev: &dyn BlockDev, id: Uuid) -> Result<PvLabel> {
    let info = dev.get_info()?;
    let dev_size = info.size_sectors * SECTOR_SIZE as u64;

    // mda0 starts at the 9th sector; its length is reduced a little by
    // the offset to keep the data area aligned to 1MB
    let mda0_offset = (8 * SECTOR_SIZE) as u64;
    let mda0_length = MAX_METADATA_SIZE - mda0_offset;

    if dev_size < (MAX_METADATA_SIZE * 2) + mda0_offset {
        return Err(Error::Msg("device too small".into()));
    }

    let label = PvLabel {
        id,
        device_size: dev_size,
        data_areas: vec![
            // da0 length is not used
            PvArea {
                offset: mda0_offset + mda0_length,
                size: 0,
            },
        ],
        metadata_areas: vec![
            PvArea {
                offset: mda0_offset,
                size: mda0_length,
            },
            PvArea {
                offset: dev_size - MAX_METADATA_SIZE,
                size: MAX_METADATA_SIZE,
            },
        ],
    };

    write_label(dev, &label)?;

    for area in &label.metadata_areas {
        write_mda_header(
            dev,
            &MdaHeader {
                start: area.offset,
                size: area.size,
                raw_locns: Vec::new(),
            },
        )?;
    }
    dev.sync()?;

    Ok(label)
}

/// Extent geometry of a formatted PV: the sector where extent 0
/// starts (data area start aligned up to the extent size) and how many
/// whole extents fit before the trailing metadata area.
pub fn pe_geometry(label: &PvLabel, extent_size: u64) -> Result<(u64, u64)> {
    let da = label
        .data_areas
        .get(0)
        .ok_or_else(|| Error::Msg("no data area in PV".into()))?;

    let dev_size_sectors = label.device_size / SECTOR_SIZE as u64;
    let pe_start_sectors = align_to(
        (da.offset / SECTOR_SIZE as u64) as usize,
        extent_size as usize,
    ) as u64;
    let mda1_size_sectors = match label.metadata_areas.get(1) {
        Some(area) => area.size / SECTOR_SIZE as u64,
        None => 0,
    };
    let area_size_sectors = dev_size_sectors
        .checked_sub(pe_start_sectors + mda1_size_sectors)
        .ok_or_else(|| Error::Msg("device too small".into()))?;

    Ok((pe_start_sectors, area_size_sectors / extent_size))
}
