// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crc::crc32;

// LVM2's on-disk checksums (label sector, mda header, metadata text)
// use the reflected CRC-32 polynomial but a nonstandard initial value,
// and skip the usual final complement. crc32::update complements at
// both ends, so undo that on the way in and out. Byte-exact agreement
// here is what lets stock lvm tools accept metadata we write.
const INITIAL_CRC: u32 = 0xf597a6cf;
const CRC_SEED: u32 = 0xedb88320;

pub fn align_to(num: usize, align_to: usize) -> usize {
    let agn = align_to - 1;

    (num + agn) & !agn
}

pub fn crc32_calc(buf: &[u8]) -> u32 {
    let table = crc32::make_table(CRC_SEED);

    !crc32::update(!INITIAL_CRC, &table, buf)
}
