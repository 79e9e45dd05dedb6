// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical volumes as block devices.
//!
//! A [`Volume`] translates LV sector addresses through the segment map
//! into reads and writes on the underlying PV devices. It holds a
//! snapshot of the LV record; metadata changes made after connecting
//! are not visible through it.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::block::{BlockDev, BlockInfo};
use crate::lv::{self, Lv, SegmentKind};
use crate::pv::PvName;
use crate::uuid::Uuid;
use crate::vg::Metadata;
use crate::{Error, Result};

struct PvDevice {
    dev: Arc<dyn BlockDev>,
    /// Sector where extent 0 starts on this PV.
    pe_start: u64,
}

// One contiguous run of device sectors that a span of LV sectors maps
// onto.
struct Span<'a> {
    pv_name: &'a PvName,
    dev: &'a dyn BlockDev,
    /// Byte offset on the device.
    dev_off: u64,
    /// Length of the run in bytes.
    nbytes: usize,
}

/// A sector-addressable handle onto one LV.
pub struct Volume {
    lv: Lv,
    extent_size: u64,
    sector_size: usize,
    devices: BTreeMap<PvName, PvDevice>,
    connected: bool,
}

impl Volume {
    /// Open the LV with the given id against the VG's devices. All
    /// devices must agree on a sector size.
    pub fn connect(
        meta: &Metadata,
        devices: &[(PvName, Arc<dyn BlockDev>)],
        id: &Uuid,
    ) -> Result<Volume> {
        let lv = meta
            .lv_get(id)
            .ok_or_else(|| Error::UnknownLv(id.to_string()))?
            .clone();

        let mut sector_size = None;
        let mut dev_map = BTreeMap::new();

        for (name, dev) in devices {
            let info = dev.get_info()?;
            match sector_size {
                None => sector_size = Some(info.sector_size),
                Some(s) if s == info.sector_size => {}
                Some(s) => {
                    return Err(Error::Msg(format!(
                        "pv {}: sector size {} differs from {}",
                        name, info.sector_size, s
                    )));
                }
            }

            let pv = meta.pv_get(name).ok_or_else(|| {
                Error::Msg(format!("pv {}: not a member of vg {}", name, meta.name))
            })?;
            dev_map.insert(
                name.clone(),
                PvDevice {
                    dev: dev.clone(),
                    pe_start: pv.pe_start,
                },
            );
        }

        let sector_size =
            sector_size.ok_or_else(|| Error::Msg("no devices to connect to".into()))?;

        debug!(
            "connected volume {} ({} extents)",
            lv.name,
            lv.size_in_extents()
        );

        Ok(Volume {
            lv,
            extent_size: meta.extent_size,
            sector_size,
            devices: dev_map,
            connected: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.lv.name
    }

    pub fn get_info(&self) -> Result<BlockInfo> {
        self.check_connected()?;
        Ok(BlockInfo {
            read_write: self.lv.is_writable(),
            sector_size: self.sector_size,
            size_sectors: self.lv.size_in_extents() * self.extent_size,
        })
    }

    /// Read sectors starting at `start_sector`. The buffer length must
    /// be a sector multiple.
    pub fn read(&self, start_sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_io(buf.len())?;

        let mut sector = start_sector;
        let mut done = 0;
        while done < buf.len() {
            let span = self.map_span(sector, ((buf.len() - done) / self.sector_size) as u64)?;
            span.dev
                .read_at(span.dev_off, &mut buf[done..done + span.nbytes])
                .map_err(|e| Error::Msg(format!("pv {}: {}", span.pv_name, e)))?;
            sector += (span.nbytes / self.sector_size) as u64;
            done += span.nbytes;
        }
        Ok(())
    }

    /// Write sectors starting at `start_sector`. The buffer length
    /// must be a sector multiple.
    pub fn write(&self, start_sector: u64, buf: &[u8]) -> Result<()> {
        self.check_io(buf.len())?;
        if !self.lv.is_writable() {
            return Err(Error::Msg(format!("lv {} is read-only", self.lv.name)));
        }

        let mut sector = start_sector;
        let mut done = 0;
        while done < buf.len() {
            let span = self.map_span(sector, ((buf.len() - done) / self.sector_size) as u64)?;
            span.dev
                .write_at(span.dev_off, &buf[done..done + span.nbytes])
                .map_err(|e| Error::Msg(format!("pv {}: {}", span.pv_name, e)))?;
            sector += (span.nbytes / self.sector_size) as u64;
            done += span.nbytes;
        }
        Ok(())
    }

    /// Read into a list of buffers, advancing the sector position
    /// across them.
    pub fn readv(&self, start_sector: u64, bufs: &mut [&mut [u8]]) -> Result<()> {
        let mut sector = start_sector;
        for buf in bufs {
            self.read(sector, buf)?;
            sector += (buf.len() / self.sector_size) as u64;
        }
        Ok(())
    }

    /// Write from a list of buffers, advancing the sector position
    /// across them.
    pub fn writev(&self, start_sector: u64, bufs: &[&[u8]]) -> Result<()> {
        let mut sector = start_sector;
        for buf in bufs {
            self.write(sector, buf)?;
            sector += (buf.len() / self.sector_size) as u64;
        }
        Ok(())
    }

    /// Overwrite the whole volume with `pattern`, in bounded chunks.
    pub fn erase(&self, pattern: u8) -> Result<()> {
        let info = self.get_info()?;
        let chunk_sectors: u64 = 128; // 64KiB at 512b sectors
        let chunk = vec![pattern; chunk_sectors as usize * self.sector_size];

        let mut sector = 0;
        while sector < info.size_sectors {
            let n = std::cmp::min(chunk_sectors, info.size_sectors - sector);
            self.write(sector, &chunk[..n as usize * self.sector_size])?;
            sector += n;
        }
        Ok(())
    }

    /// Barrier across every underlying device.
    pub fn sync(&self) -> Result<()> {
        self.check_connected()?;
        for pvdev in self.devices.values() {
            pvdev.dev.sync()?;
        }
        Ok(())
    }

    /// Detach from the underlying devices; all further calls fail.
    pub fn disconnect(&mut self) {
        debug!("disconnected volume {}", self.lv.name);
        self.connected = false;
    }

    fn check_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::Msg("volume disconnected".into()));
        }
        Ok(())
    }

    fn check_io(&self, len: usize) -> Result<()> {
        self.check_connected()?;
        if len % self.sector_size != 0 {
            return Err(Error::Msg(format!(
                "buffer length {} is not a sector multiple",
                len
            )));
        }
        Ok(())
    }

    // Translate `sector` into a run on the backing device, bounded by
    // the end of the containing extent and by `max_sectors`.
    fn map_span(&self, sector: u64, max_sectors: u64) -> Result<Span> {
        let le = sector / self.extent_size;
        let off = sector % self.extent_size;

        let seg = lv::find_extent(&self.lv, le).ok_or_else(|| {
            Error::Msg(format!(
                "lv {}: sector {} is beyond the end of the volume",
                self.lv.name, sector
            ))
        })?;

        let lin = match seg.kind {
            SegmentKind::Linear(ref lin) => lin,
            SegmentKind::Striped { .. } => {
                return Err(Error::Msg(
                    "striped segments are not supported for I/O".into(),
                ));
            }
        };

        let pvdev = self.devices.get(&lin.pv_name).ok_or_else(|| {
            Error::Msg(format!(
                "lv {}: no device for PV {}",
                self.lv.name, lin.pv_name
            ))
        })?;

        let pe = lin.pv_start_extent + (le - seg.start_extent);
        let dev_sector = pvdev.pe_start + pe * self.extent_size + off;
        let nsectors = std::cmp::min(max_sectors, self.extent_size - off);

        Ok(Span {
            pv_name: &lin.pv_name,
            dev: pvdev.dev.as_ref(),
            dev_off: dev_sector * self.sector_size as u64,
            nbytes: nsectors as usize * self.sector_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocation;
    use crate::block::MemBlockDev;
    use crate::lv::LvStatus;
    use crate::pv::Pv;
    use crate::pvlabel::{PvArea, PvLabel};
    use crate::vg::{self, VgStatus, DEFAULT_EXTENT_SIZE};

    const MIB: u64 = 1024 * 1024;

    fn test_pv(name: &str, pe_count: u64) -> Pv {
        let id = Uuid::create();
        Pv {
            id,
            name: PvName::of_string(name).unwrap(),
            device: format!("/dev/{}", name),
            status: vec!["ALLOCATABLE".to_string()],
            pe_start: 8192,
            pe_count,
            label: PvLabel {
                id,
                device_size: 64 * MIB,
                data_areas: vec![PvArea {
                    offset: MIB,
                    size: 0,
                }],
                metadata_areas: Vec::new(),
            },
        }
    }

    fn test_setup(
        pe_counts: &[(&str, u64)],
    ) -> (Metadata, Vec<(PvName, Arc<dyn BlockDev>)>) {
        let pvs: Vec<_> = pe_counts
            .iter()
            .map(|&(name, count)| test_pv(name, count))
            .collect();
        let mut meta = Metadata {
            name: "vg00".to_string(),
            id: Uuid::create(),
            creation_host: "testhost".to_string(),
            creation_time: 1400000000,
            seqno: 1,
            status: vec![VgStatus::Read, VgStatus::Write, VgStatus::Resizeable],
            extent_size: DEFAULT_EXTENT_SIZE,
            max_lv: 0,
            max_pv: 0,
            pvs,
            lvs: std::collections::BTreeMap::new(),
            free_space: Allocation::default(),
        };
        meta.free_space = meta.full_extents();

        let devices: Vec<(PvName, Arc<dyn BlockDev>)> = meta
            .pvs
            .iter()
            .map(|pv| {
                (
                    pv.name.clone(),
                    Arc::new(MemBlockDev::new(64 * MIB as usize, true)) as Arc<dyn BlockDev>,
                )
            })
            .collect();

        (meta, devices)
    }

    #[test]
    fn io_lands_at_translated_offsets() {
        let (meta, devices) = test_setup(&[("a", 14), ("b", 14)]);
        // 18 extents: 14 on a, 4 spilling onto b
        let meta = vg::do_op(&meta, &meta.create("v1", 72 * MIB, "h", 0).unwrap()).unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;

        let vol = Volume::connect(&meta, &devices, &id).unwrap();
        let info = vol.get_info().unwrap();
        assert!(info.read_write);
        assert_eq!(info.size_sectors, 18 * 8192);

        let mut payload = vec![0u8; 1024];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        // sector 0 maps to pe 0 on a, just past pe_start
        vol.write(0, &payload).unwrap();
        let mut got = vec![0u8; 1024];
        devices[0].1.read_at(8192 * 512, &mut got).unwrap();
        assert_eq!(got, payload);

        // extent 14 is the first on b
        vol.write(14 * 8192, &payload).unwrap();
        devices[1].1.read_at(8192 * 512, &mut got).unwrap();
        assert_eq!(got, payload);

        // and reads translate the same way
        vol.read(14 * 8192, &mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn io_spanning_an_extent_boundary() {
        let (meta, devices) = test_setup(&[("a", 14), ("b", 14)]);
        let meta = vg::do_op(&meta, &meta.create("v1", 72 * MIB, "h", 0).unwrap()).unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;
        let vol = Volume::connect(&meta, &devices, &id).unwrap();

        // 4 sectors straddling the a/b boundary at extent 14
        let payload: Vec<u8> = (0..4 * 512).map(|i| (i % 253) as u8).collect();
        vol.write(14 * 8192 - 2, &payload).unwrap();

        let mut back = vec![0u8; 4 * 512];
        vol.read(14 * 8192 - 2, &mut back).unwrap();
        assert_eq!(back, payload);

        // last two sectors of a's final extent, first two of b's first
        let mut tail_a = vec![0u8; 1024];
        devices[0].1.read_at((8192 + 14 * 8192 - 2) * 512, &mut tail_a).unwrap();
        assert_eq!(tail_a, payload[..1024]);
        let mut head_b = vec![0u8; 1024];
        devices[1].1.read_at(8192 * 512, &mut head_b).unwrap();
        assert_eq!(head_b, payload[1024..]);
    }

    #[test]
    fn io_beyond_the_end_fails() {
        let (meta, devices) = test_setup(&[("a", 14)]);
        let meta = vg::do_op(&meta, &meta.create("v1", 4 * MIB, "h", 0).unwrap()).unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;
        let vol = Volume::connect(&meta, &devices, &id).unwrap();

        let mut buf = vec![0u8; 512];
        assert!(vol.read(8192, &mut buf).is_err());
        // unaligned buffer
        assert!(vol.read(0, &mut buf[..100]).is_err());
    }

    #[test]
    fn vectored_io() {
        let (meta, devices) = test_setup(&[("a", 14)]);
        let meta = vg::do_op(&meta, &meta.create("v1", 8 * MIB, "h", 0).unwrap()).unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;
        let vol = Volume::connect(&meta, &devices, &id).unwrap();

        let one = vec![1u8; 512];
        let two = vec![2u8; 1024];
        vol.writev(10, &[&one, &two]).unwrap();

        let mut back = vec![0u8; 512 * 3];
        vol.read(10, &mut back).unwrap();
        assert_eq!(&back[..512], &one[..]);
        assert_eq!(&back[512..], &two[..]);

        let mut b1 = vec![0u8; 1024];
        let mut b2 = vec![0u8; 512];
        vol.readv(10, &mut [&mut b1, &mut b2]).unwrap();
        assert_eq!(&b1[..512], &one[..]);
        assert_eq!(&b1[512..], &two[..512]);
        assert_eq!(&b2[..], &two[512..]);
    }

    #[test]
    fn disconnect_blocks_io() {
        let (meta, devices) = test_setup(&[("a", 14)]);
        let meta = vg::do_op(&meta, &meta.create("v1", 4 * MIB, "h", 0).unwrap()).unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;
        let mut vol = Volume::connect(&meta, &devices, &id).unwrap();

        vol.disconnect();
        let mut buf = vec![0u8; 512];
        assert!(vol.read(0, &mut buf).is_err());
        assert!(vol.get_info().is_err());
    }

    #[test]
    fn read_only_lv_rejects_writes() {
        let (meta, devices) = test_setup(&[("a", 14)]);
        let meta = vg::do_op(&meta, &meta.create("v1", 4 * MIB, "h", 0).unwrap()).unwrap();
        let meta = vg::do_op(
            &meta,
            &meta.set_status("v1", vec![LvStatus::Read, LvStatus::Visible]).unwrap(),
        )
        .unwrap();
        let id = meta.lv_by_name("v1").unwrap().id;
        let vol = Volume::connect(&meta, &devices, &id).unwrap();

        assert!(!vol.get_info().unwrap().read_write);
        assert!(vol.write(0, &[0u8; 512]).is_err());
    }
}
