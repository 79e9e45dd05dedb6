// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The redo log: a ring-buffered journal of metadata ops.
//!
//! Rewriting the text metadata on every PV for every mutation is slow,
//! so mutations are appended here first and the metadata areas are
//! rewritten in batches. The journal lives in its own LV, reached
//! through a [`Volume`] like any other.
//!
//! On disk, sector 0 holds the header (producer and consumer
//! pointers, rewritten in a single atomic sector write). Records start
//! at sector-aligned ring offsets and never straddle the ring end: a
//! record that would not fit in the tail is preceded by a pad marker
//! and placed at the ring start instead. The record payload is the op
//! in a tagged binary form, CRC-protected so replay stops cleanly at a
//! torn tail.
//!
//! A record is pushed durably before the producer pointer moves past
//! it. Consumed records are acknowledged by advancing the consumer
//! pointer once the metadata areas have been rewritten; until then
//! they replay on the next open, which is safe because ops are
//! idempotent.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::lv::{LinearSegment, Lv, LvStatus, Segment, SegmentKind, Tag};
use crate::pv::PvName;
use crate::util::{align_to, crc32_calc};
use crate::uuid::Uuid;
use crate::vg::Op;
use crate::volume::Volume;
use crate::{Error, Result};

/// Name of the LV the journal lives in.
pub const REDO_LOG_LV_NAME: &str = "mirage_block_volume_redo_log";

/// Size of the journal LV in bytes.
pub const REDO_LOG_SIZE: u64 = 32 * 1024 * 1024;

const REDO_MAGIC: &[u8] = b"MLVMREDO";
const REDO_VERSION: u32 = 1;
const HEADER_SIZE: usize = 512;
const RECORD_HEADER: usize = 16;
// a len field of all-ones marks a skipped ring tail
const PAD_MARKER: u32 = 0xffff_ffff;

struct PendingRecord {
    seq: u64,
    /// Ring offset just past this record.
    end_offset: u64,
    op: Op,
}

/// An open journal.
pub struct RedoLog {
    vol: Volume,
    sector_size: usize,
    /// Ring capacity in bytes (volume size minus the header sector).
    data_len: u64,
    /// Monotonic byte offsets into the ring; position is offset
    /// modulo data_len. Both always sector-aligned.
    producer: u64,
    consumer: u64,
    next_seq: u64,
    pending: Vec<PendingRecord>,
}

impl RedoLog {
    /// Stamp a virgin journal header. The volume should have been
    /// erased first.
    pub fn format(vol: &Volume) -> Result<()> {
        write_header(vol, 0, 0, 1)?;
        vol.sync()
    }

    /// Open a journal and load the records that were pushed but never
    /// acknowledged; the session replays them before accepting new
    /// pushes.
    pub fn open(vol: Volume) -> Result<RedoLog> {
        let info = vol.get_info()?;
        let total = info.size_sectors * info.sector_size as u64;
        if total <= HEADER_SIZE as u64 {
            return Err(Error::Msg("redo log volume too small".into()));
        }
        let data_len = total - HEADER_SIZE as u64;

        let mut hdr = vec![0u8; HEADER_SIZE];
        vol.read(0, &mut hdr)?;

        if &hdr[..8] != REDO_MAGIC {
            return Err(Error::Msg("not a redo log".into()));
        }
        let version = LittleEndian::read_u32(&hdr[8..12]);
        if version != REDO_VERSION {
            return Err(Error::Msg(format!("bad redo log version {}", version)));
        }
        if LittleEndian::read_u32(&hdr[12..16]) != crc32_calc(&hdr[16..48]) {
            return Err(Error::Msg("corrupt metadata: redo log header checksum".into()));
        }

        let producer = LittleEndian::read_u64(&hdr[16..24]);
        let consumer = LittleEndian::read_u64(&hdr[24..32]);
        let next_seq = LittleEndian::read_u64(&hdr[32..40]);

        if consumer > producer
            || producer - consumer > data_len
            || producer % info.sector_size as u64 != 0
            || consumer % info.sector_size as u64 != 0
        {
            return Err(Error::Msg("corrupt metadata: redo log pointers".into()));
        }

        let mut log = RedoLog {
            vol,
            sector_size: info.sector_size,
            data_len,
            producer,
            consumer,
            next_seq,
            pending: Vec::new(),
        };
        log.load_pending()?;

        debug!(
            "opened redo log: {} pending records, next seq {}",
            log.pending.len(),
            log.next_seq
        );
        Ok(log)
    }

    // Walk the ring from consumer to producer, collecting records.
    // A record that fails its checksum ends the walk: it is the torn
    // tail of an interrupted push.
    fn load_pending(&mut self) -> Result<()> {
        let mut off = self.consumer;

        while off < self.producer {
            let pos = off % self.data_len;
            let tail = self.data_len - pos;

            let mut first = vec![0u8; self.sector_size];
            self.read_ring(pos, &mut first)?;

            let len = LittleEndian::read_u32(&first[..4]);
            if len == PAD_MARKER {
                off += tail;
                continue;
            }

            let total = align_to(RECORD_HEADER + len as usize, self.sector_size) as u64;
            if total > tail || off + total > self.producer {
                warn!("redo log record at {:#x} overruns the journal, dropping tail", off);
                self.producer = off;
                break;
            }

            let mut rec = vec![0u8; total as usize];
            self.read_ring(pos, &mut rec)?;

            let seq = LittleEndian::read_u64(&rec[4..12]);
            let crc = LittleEndian::read_u32(&rec[12..16]);
            let payload = &rec[RECORD_HEADER..RECORD_HEADER + len as usize];

            if crc != crc32_calc(payload) {
                warn!("redo log record {} is torn, dropping tail", seq);
                self.producer = off;
                break;
            }

            let op = op_of_bytes(payload)?;
            off += total;
            self.pending.push(PendingRecord {
                seq,
                end_offset: off,
                op,
            });
        }

        Ok(())
    }

    /// Sequence numbers and ops of every record not yet acknowledged,
    /// in push order.
    pub fn pending_ops(&self) -> Vec<(u64, Op)> {
        self.pending
            .iter()
            .map(|rec| (rec.seq, rec.op.clone()))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The sequence number of the most recently pushed record.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Append one op. Returns its sequence number, or `None` when the
    /// ring has no room; the caller then flushes and retries.
    pub fn push(&mut self, op: &Op) -> Result<Option<u64>> {
        let payload = op_to_bytes(op);
        let total = align_to(RECORD_HEADER + payload.len(), self.sector_size) as u64;
        if total > self.data_len {
            return Err(Error::Msg("redo record too large for the journal".into()));
        }

        let pos = self.producer % self.data_len;
        let tail = self.data_len - pos;
        let (pad, place_off) = if total > tail {
            (true, self.producer + tail)
        } else {
            (false, self.producer)
        };

        if place_off + total - self.consumer > self.data_len {
            return Ok(None);
        }

        if pad {
            let mut marker = vec![0u8; self.sector_size];
            LittleEndian::write_u32(&mut marker[..4], PAD_MARKER);
            self.write_ring(pos, &marker)?;
        }

        let seq = self.next_seq;
        let mut rec = vec![0u8; total as usize];
        LittleEndian::write_u32(&mut rec[..4], payload.len() as u32);
        LittleEndian::write_u64(&mut rec[4..12], seq);
        LittleEndian::write_u32(&mut rec[12..16], crc32_calc(&payload));
        rec[RECORD_HEADER..RECORD_HEADER + payload.len()].copy_from_slice(&payload);

        self.write_ring(place_off % self.data_len, &rec)?;
        self.vol.sync()?;

        // only now may the producer pointer cover the record
        self.producer = place_off + total;
        self.next_seq += 1;
        write_header(&self.vol, self.producer, self.consumer, self.next_seq)?;
        self.vol.sync()?;

        self.pending.push(PendingRecord {
            seq,
            end_offset: self.producer,
            op: op.clone(),
        });

        debug!("journalled record {} at ring offset {:#x}", seq, place_off);
        Ok(Some(seq))
    }

    /// Acknowledge every record up to and including `seq`: the caller
    /// has rewritten the metadata areas with their effects.
    pub fn complete_through(&mut self, seq: u64) -> Result<()> {
        let mut new_consumer = None;
        let mut keep = Vec::new();

        for rec in self.pending.drain(..) {
            if rec.seq <= seq {
                new_consumer = Some(rec.end_offset);
            } else {
                keep.push(rec);
            }
        }
        self.pending = keep;

        if let Some(consumer) = new_consumer {
            // any ring tail skipped after this point is re-walked via
            // its pad marker on the next open
            self.consumer = consumer;
            write_header(&self.vol, self.producer, self.consumer, self.next_seq)?;
            self.vol.sync()?;
            debug!("redo log consumer advanced to {:#x}", self.consumer);
        }

        Ok(())
    }
}

fn write_header(vol: &Volume, producer: u64, consumer: u64, next_seq: u64) -> Result<()> {
    let mut hdr = vec![0u8; HEADER_SIZE];
    hdr[..8].copy_from_slice(REDO_MAGIC);
    LittleEndian::write_u32(&mut hdr[8..12], REDO_VERSION);
    LittleEndian::write_u64(&mut hdr[16..24], producer);
    LittleEndian::write_u64(&mut hdr[24..32], consumer);
    LittleEndian::write_u64(&mut hdr[32..40], next_seq);
    let crc = crc32_calc(&hdr[16..48]);
    LittleEndian::write_u32(&mut hdr[12..16], crc);

    vol.write(0, &hdr)
}

impl RedoLog {
    // ring I/O: `pos` is a byte position within the data region,
    // sector-aligned, and the buffer never crosses the ring end
    fn read_ring(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let sector = 1 + pos / self.sector_size as u64;
        self.vol.read(sector, buf)
    }

    fn write_ring(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let sector = 1 + pos / self.sector_size as u64;
        self.vol.write(sector, buf)
    }
}

//
// The op wire form: a one-byte tag, then the payload fields in order,
// integers little-endian, strings and lists length-prefixed. No
// self-description beyond that; the record CRC covers torn writes.
//

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    let mut b = [0u8; 8];
    LittleEndian::write_i64(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_uuid(out: &mut Vec<u8>, id: &Uuid) {
    out.extend_from_slice(id.as_bytes());
}

fn status_code(s: LvStatus) -> u8 {
    match s {
        LvStatus::Read => 0,
        LvStatus::Write => 1,
        LvStatus::Visible => 2,
    }
}

fn status_of_code(c: u8) -> Result<LvStatus> {
    match c {
        0 => Ok(LvStatus::Read),
        1 => Ok(LvStatus::Write),
        2 => Ok(LvStatus::Visible),
        _ => Err(Error::Msg(format!("bad status code {} in redo record", c))),
    }
}

fn put_segment(out: &mut Vec<u8>, seg: &Segment) {
    put_u64(out, seg.start_extent);
    put_u64(out, seg.extent_count);
    match seg.kind {
        SegmentKind::Linear(ref lin) => {
            out.push(0);
            put_str(out, lin.pv_name.as_str());
            put_u64(out, lin.pv_start_extent);
        }
        SegmentKind::Striped {
            stripe_size,
            ref stripes,
        } => {
            out.push(1);
            put_u64(out, stripe_size.unwrap_or(0));
            put_u32(out, stripes.len() as u32);
            for (name, offset) in stripes {
                put_str(out, name.as_str());
                put_u64(out, *offset);
            }
        }
    }
}

fn put_segments(out: &mut Vec<u8>, segments: &[Segment]) {
    put_u32(out, segments.len() as u32);
    for seg in segments {
        put_segment(out, seg);
    }
}

fn put_lv(out: &mut Vec<u8>, lv: &Lv) {
    put_uuid(out, &lv.id);
    put_str(out, &lv.name);
    put_u32(out, lv.tags.len() as u32);
    for tag in &lv.tags {
        put_str(out, tag.as_str());
    }
    put_u32(out, lv.status.len() as u32);
    for &s in &lv.status {
        out.push(status_code(s));
    }
    put_str(out, &lv.creation_host);
    put_i64(out, lv.creation_time);
    put_segments(out, &lv.segments);
}

/// Serialize an op for journalling.
pub fn op_to_bytes(op: &Op) -> Vec<u8> {
    let mut out = Vec::new();
    match *op {
        Op::LvCreate(ref lv) => {
            out.push(1);
            put_lv(&mut out, lv);
        }
        Op::LvExpand { ref id, ref segments } => {
            out.push(2);
            put_uuid(&mut out, id);
            put_segments(&mut out, segments);
        }
        Op::LvReduce {
            ref id,
            new_extent_count,
        } => {
            out.push(3);
            put_uuid(&mut out, id);
            put_u64(&mut out, new_extent_count);
        }
        Op::LvTransfer {
            ref src,
            ref dst,
            ref segments,
        } => {
            out.push(4);
            put_uuid(&mut out, src);
            put_uuid(&mut out, dst);
            put_segments(&mut out, segments);
        }
        Op::LvRemove(ref id) => {
            out.push(5);
            put_uuid(&mut out, id);
        }
        Op::LvRename {
            ref id,
            ref new_name,
        } => {
            out.push(6);
            put_uuid(&mut out, id);
            put_str(&mut out, new_name);
        }
        Op::LvAddTag { ref id, ref tag } => {
            out.push(7);
            put_uuid(&mut out, id);
            put_str(&mut out, tag.as_str());
        }
        Op::LvRemoveTag { ref id, ref tag } => {
            out.push(8);
            put_uuid(&mut out, id);
            put_str(&mut out, tag.as_str());
        }
        Op::LvSetStatus { ref id, ref status } => {
            out.push(9);
            put_uuid(&mut out, id);
            put_u32(&mut out, status.len() as u32);
            for &s in status {
                out.push(status_code(s));
            }
        }
    }
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Msg("truncated redo record".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn str(&mut self) -> Result<String> {
        let n = self.u32()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Msg("bad string in redo record".into()))
    }

    fn uuid(&mut self) -> Result<Uuid> {
        Uuid::from_bytes(self.take(crate::uuid::UUID_LEN)?)
    }

    fn segment(&mut self) -> Result<Segment> {
        let start_extent = self.u64()?;
        let extent_count = self.u64()?;
        let kind = match self.u8()? {
            0 => SegmentKind::Linear(LinearSegment {
                pv_name: PvName::of_string(&self.str()?)?,
                pv_start_extent: self.u64()?,
            }),
            1 => {
                let stripe_size = match self.u64()? {
                    0 => None,
                    n => Some(n),
                };
                let n = self.u32()?;
                let mut stripes = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = PvName::of_string(&self.str()?)?;
                    let offset = self.u64()?;
                    stripes.push((name, offset));
                }
                SegmentKind::Striped {
                    stripe_size,
                    stripes,
                }
            }
            k => return Err(Error::Msg(format!("bad segment kind {} in redo record", k))),
        };
        Ok(Segment {
            start_extent,
            extent_count,
            kind,
        })
    }

    fn segments(&mut self) -> Result<Vec<Segment>> {
        let n = self.u32()?;
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(self.segment()?);
        }
        Ok(out)
    }

    fn status_list(&mut self) -> Result<Vec<LvStatus>> {
        let n = self.u32()?;
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            out.push(status_of_code(self.u8()?)?);
        }
        Ok(out)
    }

    fn lv(&mut self) -> Result<Lv> {
        let id = self.uuid()?;
        let name = self.str()?;
        let ntags = self.u32()?;
        let mut tags = Vec::with_capacity(ntags as usize);
        for _ in 0..ntags {
            tags.push(Tag::of_string(&self.str()?)?);
        }
        let status = self.status_list()?;
        let creation_host = self.str()?;
        let creation_time = self.i64()?;
        let segments = self.segments()?;
        Ok(Lv {
            id,
            name,
            tags,
            status,
            creation_host,
            creation_time,
            segments,
        })
    }
}

/// Deserialize a journalled op.
pub fn op_of_bytes(buf: &[u8]) -> Result<Op> {
    let mut c = Cursor { buf, pos: 0 };

    let op = match c.u8()? {
        1 => Op::LvCreate(c.lv()?),
        2 => Op::LvExpand {
            id: c.uuid()?,
            segments: c.segments()?,
        },
        3 => Op::LvReduce {
            id: c.uuid()?,
            new_extent_count: c.u64()?,
        },
        4 => Op::LvTransfer {
            src: c.uuid()?,
            dst: c.uuid()?,
            segments: c.segments()?,
        },
        5 => Op::LvRemove(c.uuid()?),
        6 => Op::LvRename {
            id: c.uuid()?,
            new_name: c.str()?,
        },
        7 => Op::LvAddTag {
            id: c.uuid()?,
            tag: Tag::of_string(&c.str()?)?,
        },
        8 => Op::LvRemoveTag {
            id: c.uuid()?,
            tag: Tag::of_string(&c.str()?)?,
        },
        9 => Op::LvSetStatus {
            id: c.uuid()?,
            status: c.status_list()?,
        },
        t => return Err(Error::Msg(format!("bad op tag {} in redo record", t))),
    };

    if c.pos != buf.len() {
        return Err(Error::Msg("trailing bytes in redo record".into()));
    }
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocation;
    use crate::block::{BlockDev, MemBlockDev};
    use crate::pv::Pv;
    use crate::pvlabel::{PvArea, PvLabel};
    use crate::vg::{self, Metadata, VgStatus, DEFAULT_EXTENT_SIZE};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const MIB: u64 = 1024 * 1024;

    fn sample_ops() -> Vec<Op> {
        let id = Uuid::create();
        let other = Uuid::create();
        let seg = Segment {
            start_extent: 0,
            extent_count: 3,
            kind: SegmentKind::Linear(LinearSegment {
                pv_name: PvName::of_string("pv0").unwrap(),
                pv_start_extent: 7,
            }),
        };
        let striped = Segment {
            start_extent: 3,
            extent_count: 4,
            kind: SegmentKind::Striped {
                stripe_size: Some(16),
                stripes: vec![
                    (PvName::of_string("pv0").unwrap(), 10),
                    (PvName::of_string("pv1").unwrap(), 0),
                ],
            },
        };

        vec![
            Op::LvCreate(Lv {
                id,
                name: "v1".to_string(),
                tags: vec![Tag::of_string("nightly").unwrap()],
                status: vec![LvStatus::Read, LvStatus::Write, LvStatus::Visible],
                creation_host: "host.example".to_string(),
                creation_time: 1400000000,
                segments: vec![seg.clone()],
            }),
            Op::LvExpand {
                id,
                segments: vec![seg.clone(), striped],
            },
            Op::LvReduce {
                id,
                new_extent_count: 2,
            },
            Op::LvTransfer {
                src: id,
                dst: other,
                segments: vec![seg],
            },
            Op::LvRemove(id),
            Op::LvRename {
                id,
                new_name: "v2".to_string(),
            },
            Op::LvAddTag {
                id,
                tag: Tag::of_string("t").unwrap(),
            },
            Op::LvRemoveTag {
                id,
                tag: Tag::of_string("t").unwrap(),
            },
            Op::LvSetStatus {
                id,
                status: vec![LvStatus::Read],
            },
        ]
    }

    #[test]
    fn op_codec_round_trips() {
        for op in sample_ops() {
            let bytes = op_to_bytes(&op);
            let back = op_of_bytes(&bytes).unwrap();
            assert_eq!(op, back);
        }
    }

    #[test]
    fn op_codec_rejects_garbage() {
        assert!(op_of_bytes(&[]).is_err());
        assert!(op_of_bytes(&[99]).is_err());
        // truncated LvRemove
        let bytes = op_to_bytes(&Op::LvRemove(Uuid::create()));
        assert!(op_of_bytes(&bytes[..bytes.len() - 1]).is_err());
        // trailing junk
        let mut bytes = op_to_bytes(&Op::LvRemove(Uuid::create()));
        bytes.push(0);
        assert!(op_of_bytes(&bytes).is_err());
    }

    // a VG with one PV and a small journal LV to run the ring against
    fn journal_setup(
        lv_mib: u64,
    ) -> (Metadata, Vec<(PvName, Arc<dyn BlockDev>)>, Uuid) {
        let pv_id = Uuid::create();
        let pv = Pv {
            id: pv_id,
            name: PvName::of_string("a").unwrap(),
            device: "a".to_string(),
            status: vec!["ALLOCATABLE".to_string()],
            pe_start: 8192,
            pe_count: 14,
            label: PvLabel {
                id: pv_id,
                device_size: 64 * MIB,
                data_areas: vec![PvArea {
                    offset: MIB,
                    size: 0,
                }],
                metadata_areas: Vec::new(),
            },
        };
        let mut meta = Metadata {
            name: "vg00".to_string(),
            id: Uuid::create(),
            creation_host: "h".to_string(),
            creation_time: 0,
            seqno: 1,
            status: vec![VgStatus::Read, VgStatus::Write, VgStatus::Resizeable],
            extent_size: DEFAULT_EXTENT_SIZE,
            max_lv: 0,
            max_pv: 0,
            pvs: vec![pv],
            lvs: BTreeMap::new(),
            free_space: Allocation::default(),
        };
        meta.free_space = meta.full_extents();
        let meta = vg::do_op(&meta, &meta.create("journal", lv_mib * MIB, "h", 0).unwrap())
            .unwrap();
        let id = meta.lv_by_name("journal").unwrap().id;

        let devices: Vec<(PvName, Arc<dyn BlockDev>)> = vec![(
            PvName::of_string("a").unwrap(),
            Arc::new(MemBlockDev::new(64 * MIB as usize, true)) as Arc<dyn BlockDev>,
        )];

        (meta, devices, id)
    }

    fn open_journal(
        meta: &Metadata,
        devices: &[(PvName, Arc<dyn BlockDev>)],
        id: &Uuid,
    ) -> RedoLog {
        RedoLog::open(Volume::connect(meta, devices, id).unwrap()).unwrap()
    }

    #[test]
    fn push_and_replay() {
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        vol.erase(0).unwrap();
        RedoLog::format(&vol).unwrap();

        let ops = sample_ops();
        let mut log = open_journal(&meta, &devices, &id);
        assert!(!log.has_pending());
        for op in &ops {
            log.push(op).unwrap().unwrap();
        }

        // a reopened journal sees everything unacknowledged
        let log = open_journal(&meta, &devices, &id);
        let pending = log.pending_ops();
        assert_eq!(pending.len(), ops.len());
        for ((seq, got), (i, want)) in pending.iter().zip(ops.iter().enumerate()) {
            assert_eq!(*seq, i as u64 + 1);
            assert_eq!(got, want);
        }
    }

    #[test]
    fn complete_discards_prefix() {
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        vol.erase(0).unwrap();
        RedoLog::format(&vol).unwrap();

        let ops = sample_ops();
        let mut log = open_journal(&meta, &devices, &id);
        let mut seqs = Vec::new();
        for op in &ops[..3] {
            seqs.push(log.push(op).unwrap().unwrap());
        }

        log.complete_through(seqs[1]).unwrap();
        assert_eq!(log.pending_ops().len(), 1);

        let log = open_journal(&meta, &devices, &id);
        let pending = log.pending_ops();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, ops[2]);

        // acknowledging everything empties the ring
        let mut log = log;
        let last = log.last_seq();
        log.complete_through(last).unwrap();
        assert!(!log.has_pending());
        let log = open_journal(&meta, &devices, &id);
        assert!(!log.has_pending());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        vol.erase(0).unwrap();
        RedoLog::format(&vol).unwrap();

        let ops = sample_ops();
        let mut log = open_journal(&meta, &devices, &id);
        for op in &ops[..3] {
            log.push(op).unwrap().unwrap();
        }

        // corrupt the payload of the last record through the volume
        let last_start = log.pending[2].end_offset
            - align_to(RECORD_HEADER + op_to_bytes(&ops[2]).len(), 512) as u64;
        let sector = 1 + (last_start % log.data_len) / 512;
        let mut sec = vec![0u8; 512];
        vol.read(sector, &mut sec).unwrap();
        sec[RECORD_HEADER] ^= 0xff;
        vol.write(sector, &sec).unwrap();

        let log = open_journal(&meta, &devices, &id);
        let pending = log.pending_ops();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].1, ops[1]);
    }

    #[test]
    fn ring_wraps_with_pad_markers() {
        // 4MiB journal, ~600KiB records: wraps several times
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        vol.erase(0).unwrap();
        RedoLog::format(&vol).unwrap();

        let mut log = open_journal(&meta, &devices, &id);
        let big_op = |i: usize| Op::LvRename {
            id: Uuid::create(),
            new_name: format!("{}{}", "n".repeat(600 * 1024), i),
        };

        let mut expect = Vec::new();
        for i in 0..12 {
            let op = big_op(i);
            let seq = log.push(&op).unwrap().unwrap();
            expect.push((seq, op));
            // keep at most two in flight
            if expect.len() > 2 {
                let (ack, _) = expect.remove(0);
                log.complete_through(ack).unwrap();
            }
        }

        assert_eq!(log.pending_ops(), expect);

        let log = open_journal(&meta, &devices, &id);
        assert_eq!(log.pending_ops(), expect);
    }

    #[test]
    fn full_ring_asks_for_a_flush() {
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        vol.erase(0).unwrap();
        RedoLog::format(&vol).unwrap();

        let mut log = open_journal(&meta, &devices, &id);
        let op = Op::LvRename {
            id: Uuid::create(),
            new_name: "n".repeat(600 * 1024),
        };

        let mut pushed = 0;
        loop {
            match log.push(&op).unwrap() {
                Some(_) => pushed += 1,
                None => break,
            }
            assert!(pushed < 16, "ring never filled");
        }
        assert!(pushed >= 6);

        // draining the ring makes room again
        let last = log.last_seq();
        log.complete_through(last).unwrap();
        assert!(log.push(&op).unwrap().is_some());
    }

    #[test]
    fn unformatted_journal_is_rejected() {
        let (meta, devices, id) = journal_setup(4);
        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        assert!(RedoLog::open(vol).is_err());
    }
}
