// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end scenarios against memory-backed devices.

use std::sync::Arc;

use mlvm::block::{BlockDev, MemBlockDev};
use mlvm::pv::PvName;
use mlvm::pvlabel::Magic;
use mlvm::session::{Clock, Config, Mode, VgSession};
use mlvm::vg;
use mlvm::Error;

const MIB: u64 = 1024 * 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn two_pvs() -> Vec<(PvName, Arc<dyn BlockDev>)> {
    ["a", "b"]
        .iter()
        .map(|name| {
            (
                PvName::of_string(name).unwrap(),
                Arc::new(MemBlockDev::new(64 * MIB as usize, true)) as Arc<dyn BlockDev>,
            )
        })
        .collect()
}

fn devices_of(pvs: &[(PvName, Arc<dyn BlockDev>)]) -> Vec<Arc<dyn BlockDev>> {
    pvs.iter().map(|(_, dev)| dev.clone()).collect()
}

fn free_of(meta: &vg::Metadata) -> Vec<(String, u64, u64)> {
    meta.free_space
        .entries()
        .iter()
        .map(|(name, ival)| (name.to_string(), ival.start, ival.count))
        .collect()
}

// A clock the test advances by hand.
struct ManualClock(std::sync::Mutex<f64>);

impl ManualClock {
    fn new() -> Arc<ManualClock> {
        Arc::new(ManualClock(std::sync::Mutex::new(0.0)))
    }

    fn advance(&self, secs: f64) {
        *self.0.lock().unwrap() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

struct ClockHandle(Arc<ManualClock>);

impl Clock for ClockHandle {
    fn now(&self) -> f64 {
        self.0.now()
    }
}

#[test]
fn s1_create_and_reconnect() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 1400000000, Magic::Lvm, &pvs).unwrap();

    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let meta = session.metadata_of();
    assert_eq!(meta.extents(), 28);

    let op = meta.create("v1", 8 * MIB, "host0", 1400000001).unwrap();
    session.update(&[op]).unwrap();

    // a fresh connect must see the same state from disk
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let meta = session.metadata_of();

    let v1 = meta.lv_by_name("v1").unwrap();
    assert_eq!(v1.size_in_extents(), 2);
    assert_eq!(v1.segments.len(), 1);
    assert_eq!(
        free_of(&meta),
        vec![("a".to_string(), 2, 12), ("b".to_string(), 0, 14)]
    );
}

#[test]
fn s2_s3_resize_cycle() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 1400000000, Magic::Lvm, &pvs).unwrap();
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();

    let meta = session.metadata_of();
    session
        .update(&[meta.create("v1", 8 * MIB, "host0", 1).unwrap()])
        .unwrap();

    // grow to 24MiB
    let meta = session.metadata_of();
    session.update(&[meta.resize("v1", 24 * MIB).unwrap()]).unwrap();
    let meta = session.metadata_of();
    assert_eq!(meta.lv_by_name("v1").unwrap().size_in_extents(), 6);
    assert_eq!(
        free_of(&meta),
        vec![("a".to_string(), 6, 8), ("b".to_string(), 0, 14)]
    );

    // and back down to 8MiB
    session.update(&[meta.resize("v1", 8 * MIB).unwrap()]).unwrap();
    let meta = session.metadata_of();
    assert_eq!(meta.lv_by_name("v1").unwrap().size_in_extents(), 2);
    assert_eq!(
        free_of(&meta),
        vec![("a".to_string(), 2, 12), ("b".to_string(), 0, 14)]
    );

    // still true after re-reading from disk
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let meta = session.metadata_of();
    assert_eq!(meta.lv_by_name("v1").unwrap().size_in_extents(), 2);
}

#[test]
fn s4_duplicate_create_rejected() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Lvm, &pvs).unwrap();
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();

    let meta = session.metadata_of();
    session.update(&[meta.create("v1", 8 * MIB, "h", 0).unwrap()]).unwrap();

    let meta = session.metadata_of();
    match meta.create("v1", 4 * MIB, "h", 0) {
        Err(Error::DuplicateLv(ref name)) => assert_eq!(name, "v1"),
        x => panic!("unexpected {:?}", x),
    }
}

#[test]
fn s5_allocation_shortfall_reported() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Lvm, &pvs).unwrap();
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();

    let meta = session.metadata_of();
    match meta.create("v2", 40 * meta.extent_bytes(), "h", 0) {
        Err(Error::OnlyThisMuchFree { needed, available }) => {
            assert_eq!(needed, 40);
            assert_eq!(available, 28);
        }
        x => panic!("unexpected {:?}", x),
    }
}

#[test]
fn lv_io_round_trips_through_reconnect() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Lvm, &pvs).unwrap();
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();

    // 18 extents spans both PVs
    let meta = session.metadata_of();
    session.update(&[meta.create("data", 72 * MIB, "h", 0).unwrap()]).unwrap();

    let vol = session.open_volume("data").unwrap();
    let info = vol.get_info().unwrap();
    assert_eq!(info.size_sectors, 18 * 8192);

    let payload: Vec<u8> = (0..8 * 512).map(|i| (i % 199) as u8).collect();
    // straddle the PV boundary at extent 14
    let boundary = 14 * 8192 - 4;
    vol.write(boundary, &payload).unwrap();

    let mut back = vec![0u8; payload.len()];
    vol.read(boundary, &mut back).unwrap();
    assert_eq!(back, payload);

    // reconnect and read again
    drop(vol);
    drop(session);
    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let vol = session.open_volume("data").unwrap();
    let mut back = vec![0u8; payload.len()];
    vol.read(boundary, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn read_only_session_rejects_updates() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Lvm, &pvs).unwrap();

    let config = Config {
        mode: Mode::ReadOnly,
        ..Config::default()
    };
    let session = VgSession::connect(&devices_of(&pvs), config).unwrap();

    let meta = session.metadata_of();
    let op = meta.create("v1", 4 * MIB, "h", 0).unwrap();
    assert!(session.update(&[op]).is_err());
}

#[test]
fn journalled_format_reserves_the_redo_lv() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Journalled, &pvs).unwrap();

    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let meta = session.metadata_of();

    let redo = meta.lv_by_name("mirage_block_volume_redo_log").unwrap();
    assert_eq!(redo.size_in_extents() * meta.extent_bytes(), 32 * MIB);
    // 8 extents gone from PV a
    assert_eq!(meta.extents_free(), 20);

    // the journal LV is not directly addressable
    assert!(session.open_volume("mirage_block_volume_redo_log").is_err());
}

#[test]
fn s6_journal_replay_after_crash() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Journalled, &pvs).unwrap();

    // huge flush interval: nothing reaches the metadata areas on its own
    let config = Config {
        flush_interval: 1e9,
        ..Config::default()
    };

    let session = VgSession::connect(&devices_of(&pvs), config).unwrap();
    let meta = session.metadata_of();
    session.update(&[meta.create("v1", 8 * MIB, "h", 1).unwrap()]).unwrap();
    let meta = session.metadata_of();
    session
        .update(&[
            meta.resize("v1", 24 * MIB).unwrap(),
            meta.add_tag("v1", "journalled").unwrap(),
        ])
        .unwrap();

    let in_memory = session.metadata_of();
    assert_eq!(in_memory.lv_by_name("v1").unwrap().size_in_extents(), 6);

    // "crash": drop the session without sync
    drop(session);

    // a read-only peek sees only the flushed state: no v1 at all
    let ro = Config {
        mode: Mode::ReadOnly,
        ..Config::default()
    };
    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    assert!(peek.metadata_of().lv_by_name("v1").is_none());
    drop(peek);

    // a RW connect replays the journal to the exact pre-crash state
    let session = VgSession::connect(&devices_of(&pvs), config).unwrap();
    let replayed = session.metadata_of();
    assert_eq!(vg::to_text(&replayed), vg::to_text(&in_memory));
    assert_eq!(*replayed, *in_memory);

    // and the replay is durable: even a read-only peek now sees it
    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    let v1 = peek.metadata_of().lv_by_name("v1").unwrap().clone();
    assert_eq!(v1.size_in_extents(), 6);
    assert!(v1.tags.iter().any(|t| t.as_str() == "journalled"));
}

#[test]
fn flush_interval_batches_journal_flushes() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Journalled, &pvs).unwrap();

    let clock = ManualClock::new();
    let config = Config {
        flush_interval: 120.0,
        ..Config::default()
    };
    let session = VgSession::connect_with_clock(
        &devices_of(&pvs),
        config,
        Box::new(ClockHandle(clock.clone())),
    )
    .unwrap();

    let meta = session.metadata_of();
    session.update(&[meta.create("v1", 8 * MIB, "h", 1).unwrap()]).unwrap();

    // within the interval: on-disk metadata still lags
    let ro = Config {
        mode: Mode::ReadOnly,
        ..Config::default()
    };
    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    assert!(peek.metadata_of().lv_by_name("v1").is_none());
    drop(peek);

    // past the interval the next update carries the batch out
    clock.advance(121.0);
    let meta = session.metadata_of();
    session.update(&[meta.add_tag("v1", "t").unwrap()]).unwrap();

    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    assert!(peek.metadata_of().lv_by_name("v1").is_some());
}

#[test]
fn sync_makes_updates_durable() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Journalled, &pvs).unwrap();

    let config = Config {
        flush_interval: 1e9,
        ..Config::default()
    };
    let session = VgSession::connect(&devices_of(&pvs), config).unwrap();

    let meta = session.metadata_of();
    session.update(&[meta.create("v1", 8 * MIB, "h", 1).unwrap()]).unwrap();
    session.sync().unwrap();

    let ro = Config {
        mode: Mode::ReadOnly,
        ..Config::default()
    };
    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    assert!(peek.metadata_of().lv_by_name("v1").is_some());

    // sync with nothing pending is a no-op
    session.sync().unwrap();
}

#[test]
fn plain_mode_has_no_journal_overhead() {
    init_logging();
    let pvs = two_pvs();
    VgSession::format("vg00", "host0", 0, Magic::Lvm, &pvs).unwrap();

    let session = VgSession::connect(&devices_of(&pvs), Config::default()).unwrap();
    let meta = session.metadata_of();
    assert!(meta.lv_by_name("mirage_block_volume_redo_log").is_none());
    assert_eq!(meta.extents_free(), 28);

    // every update is immediately durable
    session.update(&[meta.create("v1", 4 * MIB, "h", 0).unwrap()]).unwrap();
    let ro = Config {
        mode: Mode::ReadOnly,
        ..Config::default()
    };
    let peek = VgSession::connect(&devices_of(&pvs), ro).unwrap();
    assert!(peek.metadata_of().lv_by_name("v1").is_some());
}
