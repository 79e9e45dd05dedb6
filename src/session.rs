// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! VG sessions: a set of opened devices plus cached metadata.
//!
//! All mutation goes through [`VgSession::update`], serialized under
//! one mutex. Readers take cheap [`Arc`] snapshots of the metadata;
//! each update publishes a fresh value. In journalled mode the in-
//! memory state advances as soon as `update` returns, while the slow
//! rewrite of the PV metadata areas is batched behind the redo log and
//! forced by [`VgSession::sync`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{debug, info, warn};

use crate::block::BlockDev;
use crate::lv::{self, Lv, LvStatus};
use crate::pv::{Pv, PvName};
use crate::pvlabel::{self, Magic, PvLabel};
use crate::redo::{RedoLog, REDO_LOG_LV_NAME, REDO_LOG_SIZE};
use crate::uuid::Uuid;
use crate::vg::{self, Metadata, Op, VgStatus, DEFAULT_EXTENT_SIZE};
use crate::volume::Volume;
use crate::{allocator, Error, Result};

/// Whether a session may mutate the VG.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Session configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum seconds between redo-log flushes to the metadata areas.
    pub flush_interval: f64,
    pub mode: Mode,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            flush_interval: 120.0,
            mode: Mode::ReadWrite,
        }
    }
}

/// Source of elapsed-seconds readings for flush pacing. Only
/// differences between readings are meaningful.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// The monotonic system clock.
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> SystemClock {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

struct Inner {
    redo: Option<RedoLog>,
    last_flush: f64,
}

/// An open volume group.
pub struct VgSession {
    devices: Vec<(PvName, Arc<dyn BlockDev>)>,
    metadata: RwLock<Arc<Metadata>>,
    inner: Mutex<Inner>,
    mode: Mode,
    flush_interval: f64,
    magic: Magic,
    clock: Box<dyn Clock>,
}

impl VgSession {
    /// Initialize a fresh VG across the given devices: stamp PV labels
    /// and metadata areas, and for [`Magic::Journalled`] also carve
    /// out and erase the redo-log LV. Leaves the metadata committed to
    /// every PV.
    pub fn format(
        name: &str,
        host: &str,
        time: i64,
        magic: Magic,
        devices: &[(PvName, Arc<dyn BlockDev>)],
    ) -> Result<()> {
        if devices.is_empty() {
            return Err(Error::Msg("one or more devices required".into()));
        }

        let mut pvs = Vec::new();
        for (pv_name, dev) in devices {
            let label = pvlabel::format(dev.as_ref(), Uuid::create())
                .map_err(|e| Error::Msg(format!("pv {}: {}", pv_name, e)))?;
            let (pe_start, pe_count) = pvlabel::pe_geometry(&label, DEFAULT_EXTENT_SIZE)?;
            if pe_count == 0 {
                return Err(Error::Msg(format!("pv {}: no room for any extents", pv_name)));
            }
            pvs.push(Pv {
                id: label.id,
                name: pv_name.clone(),
                device: pv_name.to_string(),
                status: vec!["ALLOCATABLE".to_string()],
                pe_start,
                pe_count,
                label,
            });
        }

        let mut meta = Metadata {
            name: name.to_string(),
            id: Uuid::create(),
            creation_host: host.to_string(),
            creation_time: time,
            seqno: 1,
            status: vec![VgStatus::Read, VgStatus::Write, VgStatus::Resizeable],
            extent_size: DEFAULT_EXTENT_SIZE,
            max_lv: 0,
            max_pv: 0,
            pvs,
            lvs: BTreeMap::new(),
            free_space: allocator::Allocation::default(),
        };
        meta.free_space = meta.full_extents();
        meta.check()?;

        if magic == Magic::Journalled {
            let extents = meta.bytes_to_extents(REDO_LOG_SIZE);
            let alloc = allocator::find(&meta.free_space, extents)?;
            let redo_lv = Lv {
                id: Uuid::create(),
                name: REDO_LOG_LV_NAME.to_string(),
                tags: Vec::new(),
                // deliberately not VISIBLE
                status: vec![LvStatus::Read, LvStatus::Write],
                creation_host: host.to_string(),
                creation_time: time,
                segments: lv::linear(0, &alloc),
            };
            let redo_id = redo_lv.id;
            meta = vg::do_op(&meta, &Op::LvCreate(redo_lv))?;

            let vol = Volume::connect(&meta, devices, &redo_id)?;
            vol.erase(0)?;
            RedoLog::format(&vol)?;
            info!("formatted {} as the redo log", REDO_LOG_LV_NAME);
        }

        write_metadata_all(&meta, devices, magic)?;
        info!("formatted vg {} with {} PVs", name, devices.len());
        Ok(())
    }

    /// Open a VG from its devices.
    pub fn connect(devices: &[Arc<dyn BlockDev>], config: Config) -> Result<VgSession> {
        Self::connect_with_clock(devices, config, Box::new(SystemClock::default()))
    }

    /// As [`connect`](VgSession::connect), with flush pacing driven by
    /// the given clock.
    pub fn connect_with_clock(
        devices: &[Arc<dyn BlockDev>],
        config: Config,
        clock: Box<dyn Clock>,
    ) -> Result<VgSession> {
        if devices.is_empty() {
            return Err(Error::Msg("one or more devices required".into()));
        }

        let mut labelled = Vec::new();
        for dev in devices {
            let label = pvlabel::read_label(dev.as_ref())?;
            labelled.push((label, dev.clone()));
        }

        let magic = pvlabel::read_magic(labelled[0].1.as_ref(), &labelled[0].0)?;

        // any PV carries the whole VG's metadata; use the first good one
        let mut text = None;
        for (label, dev) in &labelled {
            match pvlabel::read_metadata(dev.as_ref(), label) {
                Ok(t) => {
                    text = Some(t);
                    break;
                }
                Err(e) => warn!("pv {}: {}", label.id, e),
            }
        }
        let text = text.ok_or_else(|| Error::Msg("no valid metadata found".into()))?;

        let labels: BTreeMap<Uuid, PvLabel> = labelled
            .iter()
            .map(|(label, _)| (label.id, label.clone()))
            .collect();
        let meta = vg::from_buf(&text, &labels)?;

        let mut dev_list = Vec::new();
        for pv in &meta.pvs {
            let dev = labelled
                .iter()
                .find(|(label, _)| label.id == pv.id)
                .map(|(_, dev)| dev.clone())
                .ok_or_else(|| Error::Msg(format!("pv {}: device not present", pv.name)))?;
            dev_list.push((pv.name.clone(), dev));
        }

        info!(
            "connected vg {} (seqno {}, {} PVs, {} LVs)",
            meta.name,
            meta.seqno,
            meta.pvs.len(),
            meta.lvs.len()
        );

        let last_flush = clock.now();
        let mut session = VgSession {
            devices: dev_list,
            metadata: RwLock::new(Arc::new(meta)),
            inner: Mutex::new(Inner {
                redo: None,
                last_flush,
            }),
            mode: config.mode,
            flush_interval: config.flush_interval,
            magic,
            clock,
        };

        if magic == Magic::Journalled && config.mode == Mode::ReadWrite {
            session.open_redo_log()?;
        }

        Ok(session)
    }

    // Open the journal LV and replay whatever was pushed but never
    // flushed to the metadata areas.
    fn open_redo_log(&mut self) -> Result<()> {
        let meta = self.metadata_of();
        let redo_lv = meta.lv_by_name(REDO_LOG_LV_NAME).ok_or_else(|| {
            Error::Msg(format!("journalled vg {} has no {}", meta.name, REDO_LOG_LV_NAME))
        })?;

        let vol = Volume::connect(&meta, &self.devices, &redo_lv.id)?;
        let mut redo = RedoLog::open(vol)?;

        let pending = redo.pending_ops();
        if !pending.is_empty() {
            info!("replaying {} journalled ops", pending.len());

            let mut replayed = (*meta).clone();
            for (seq, op) in &pending {
                debug!("replaying record {}", seq);
                replayed = vg::do_op(&replayed, op)?;
            }

            write_metadata_all(&replayed, &self.devices, self.magic)?;
            let last = pending[pending.len() - 1].0;
            redo.complete_through(last)?;

            *self.metadata.write().expect("lock poisoned") = Arc::new(replayed);
        }

        self.inner.get_mut().expect("lock poisoned").redo = Some(redo);
        Ok(())
    }

    /// A consistent snapshot of the current metadata.
    pub fn metadata_of(&self) -> Arc<Metadata> {
        self.metadata.read().expect("lock poisoned").clone()
    }

    /// Apply ops in order, all or nothing. On return the in-memory
    /// metadata reflects every op; durability in the PV metadata areas
    /// is immediate without a journal, batched with one.
    pub fn update(&self, ops: &[Op]) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::Msg("session is read-only".into()));
        }

        let mut inner = self.inner.lock().expect("lock poisoned");
        let inner = &mut *inner;

        let mut meta = (*self.metadata_of()).clone();
        for op in ops {
            meta = vg::do_op(&meta, op)?;
        }

        // publish before journalling: a failure past this point leaves
        // the in-memory state ahead of the disk, never behind the
        // journal
        *self.metadata.write().expect("lock poisoned") = Arc::new(meta.clone());

        match inner.redo {
            Some(ref mut redo) => {
                for op in ops {
                    if redo.push(op)?.is_none() {
                        // ring full: flush the batch to make room.
                        // the new metadata already includes this op;
                        // replay tolerates the overlap.
                        debug!("redo log full, flushing early");
                        write_metadata_all(&meta, &self.devices, self.magic)?;
                        redo.complete_through(redo.last_seq())?;
                        inner.last_flush = self.clock.now();

                        if redo.push(op)?.is_none() {
                            return Err(Error::Msg("redo log full".into()));
                        }
                    }
                }

                let now = self.clock.now();
                if now - inner.last_flush >= self.flush_interval {
                    write_metadata_all(&meta, &self.devices, self.magic)?;
                    redo.complete_through(redo.last_seq())?;
                    inner.last_flush = now;
                }
            }
            None => {
                write_metadata_all(&meta, &self.devices, self.magic)?;
            }
        }

        Ok(())
    }

    /// Force the journal out to the metadata areas. On success every
    /// preceding [`update`](VgSession::update) is durable.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let inner = &mut *inner;

        if let Some(ref mut redo) = inner.redo {
            if redo.has_pending() {
                let meta = self.metadata_of();
                write_metadata_all(&meta, &self.devices, self.magic)?;
                redo.complete_through(redo.last_seq())?;
                inner.last_flush = self.clock.now();
            }
        }
        Ok(())
    }

    /// Open an LV as a block device. The redo log is off limits.
    pub fn open_volume(&self, name: &str) -> Result<Volume> {
        if name == REDO_LOG_LV_NAME {
            return Err(Error::Msg(format!("{} cannot be opened directly", name)));
        }

        let meta = self.metadata_of();
        let lv = meta
            .lv_by_name(name)
            .ok_or_else(|| Error::UnknownLv(name.to_string()))?;
        Volume::connect(&meta, &self.devices, &lv.id)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}

// Rewrite the text metadata on every PV in the VG.
fn write_metadata_all(
    meta: &Metadata,
    devices: &[(PvName, Arc<dyn BlockDev>)],
    magic: Magic,
) -> Result<()> {
    let text = vg::to_text(meta);

    for pv in &meta.pvs {
        let dev = devices
            .iter()
            .find(|(name, _)| *name == pv.name)
            .map(|(_, dev)| dev)
            .ok_or_else(|| Error::Msg(format!("pv {}: device not present", pv.name)))?;

        pvlabel::write_metadata(dev.as_ref(), &pv.label, &text, magic)
            .map_err(|e| Error::Msg(format!("pv {}: {}", pv.name, e)))?;
    }

    debug!("committed metadata seqno {} to {} PVs", meta.seqno, meta.pvs.len());
    Ok(())
}
