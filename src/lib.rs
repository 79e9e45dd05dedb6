// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A pure-userland volume manager, binary-compatible with the LVM2
//! on-disk format.
//!
//! Open a set of block devices as a [`session::VgSession`], mutate the
//! volume group through [`vg::Op`]s, and do I/O to logical volumes
//! through [`volume::Volume`] handles. In journalled mode mutations
//! are batched through a ring-buffered redo log ([`redo`]) instead of
//! rewriting every PV's metadata area each time.

pub mod allocator;
pub mod block;
pub mod lv;
pub mod parser;
pub mod pv;
pub mod pvlabel;
pub mod redo;
pub mod session;
pub mod uuid;
pub mod vg;
pub mod volume;

mod error;
mod util;

pub use crate::error::{Error, Result};
