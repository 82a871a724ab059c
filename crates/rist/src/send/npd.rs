// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Null packet deletion.
//!
//! MPEG-TS carries stuffing cells on PID 0x1FFF to hold a constant
//! bitrate; they carry no data, so the send path elides them and
//! records their positions in a one-byte map (bit i = cell i was a
//! null). A receiver that understands the flag rebuilds the exact
//! original block; one that does not simply plays the shorter block.
//! Blocks that do not look like clean TS (length not a multiple of
//! 188, bad sync bytes, more than eight cells) pass through untouched.

/// MPEG-TS cell size.
pub const TS_CELL: usize = 188;

/// Sync byte opening every TS cell.
pub const TS_SYNC: u8 = 0x47;

/// PID carried by null (stuffing) cells.
pub const TS_NULL_PID: u16 = 0x1FFF;

/// Cells per datagram the one-byte map can describe.
pub const NPD_MAX_CELLS: usize = 8;

#[inline]
fn cell_pid(cell: &[u8]) -> u16 {
    (u16::from(cell[1] & 0x1F) << 8) | u16::from(cell[2])
}

/// Elide null cells from a TS block.
///
/// Returns the shortened payload and the position map, or `None` when
/// the block is not eligible (not clean TS, too many cells, or no
/// nulls to remove).
pub fn elide(payload: &[u8]) -> Option<(Vec<u8>, u8)> {
    if payload.is_empty() || payload.len() % TS_CELL != 0 {
        return None;
    }
    let cells = payload.len() / TS_CELL;
    if cells > NPD_MAX_CELLS {
        return None;
    }
    if payload.chunks_exact(TS_CELL).any(|c| c[0] != TS_SYNC) {
        return None;
    }

    let mut map = 0u8;
    let mut kept = Vec::with_capacity(payload.len());
    for (i, cell) in payload.chunks_exact(TS_CELL).enumerate() {
        if cell_pid(cell) == TS_NULL_PID {
            map |= 1 << i;
        } else {
            kept.extend_from_slice(cell);
        }
    }
    if map == 0 {
        return None;
    }
    Some((kept, map))
}

/// Rebuild the original block from a shortened payload and its map.
pub fn reinsert(payload: &[u8], map: u8) -> Vec<u8> {
    if map == 0 {
        return payload.to_vec();
    }
    let elided = map.count_ones() as usize;
    let total = payload.len() / TS_CELL + elided;
    let mut out = Vec::with_capacity(total * TS_CELL);
    let mut cells = payload.chunks_exact(TS_CELL);
    for i in 0..total.min(NPD_MAX_CELLS) {
        if map & (1 << i) != 0 {
            out.extend_from_slice(&null_cell());
        } else if let Some(cell) = cells.next() {
            out.extend_from_slice(cell);
        }
    }
    // Cells beyond the map's reach (defensive, map covers 8 max).
    for cell in cells {
        out.extend_from_slice(cell);
    }
    out
}

/// A standard stuffing cell.
fn null_cell() -> [u8; TS_CELL] {
    let mut cell = [0xFFu8; TS_CELL];
    cell[0] = TS_SYNC;
    cell[1] = 0x1F;
    cell[2] = 0xFF;
    cell[3] = 0x10; // no adaptation field, payload only, cc 0
    cell
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_cell(pid: u16, fill: u8) -> Vec<u8> {
        let mut cell = vec![fill; TS_CELL];
        cell[0] = TS_SYNC;
        cell[1] = (pid >> 8) as u8 & 0x1F;
        cell[2] = (pid & 0xFF) as u8;
        cell[3] = 0x10;
        cell
    }

    fn ts_block(pids: &[u16]) -> Vec<u8> {
        let mut block = Vec::new();
        for (i, &pid) in pids.iter().enumerate() {
            block.extend_from_slice(&data_cell(pid, i as u8));
        }
        block
    }

    #[test]
    fn test_elide_and_reinsert_roundtrip() {
        let block = ts_block(&[0x100, TS_NULL_PID, 0x101, TS_NULL_PID]);
        let (kept, map) = elide(&block).expect("block is eligible");
        assert_eq!(kept.len(), 2 * TS_CELL);
        assert_eq!(map, 0b1010);

        let rebuilt = reinsert(&kept, map);
        assert_eq!(rebuilt.len(), block.len());
        // Data cells are byte-identical and in place.
        assert_eq!(&rebuilt[..TS_CELL], &block[..TS_CELL]);
        assert_eq!(&rebuilt[2 * TS_CELL..3 * TS_CELL], &block[2 * TS_CELL..3 * TS_CELL]);
        // Reinserted cells are nulls.
        assert_eq!(cell_pid(&rebuilt[TS_CELL..2 * TS_CELL]), TS_NULL_PID);
        assert_eq!(cell_pid(&rebuilt[3 * TS_CELL..4 * TS_CELL]), TS_NULL_PID);
    }

    #[test]
    fn test_no_nulls_passthrough() {
        let block = ts_block(&[0x100, 0x101]);
        assert_eq!(elide(&block), None);
    }

    #[test]
    fn test_all_nulls_empties_payload() {
        let block = ts_block(&[TS_NULL_PID; 7]);
        let (kept, map) = elide(&block).unwrap();
        assert!(kept.is_empty());
        assert_eq!(map, 0x7F);
        assert_eq!(reinsert(&kept, map).len(), 7 * TS_CELL);
    }

    #[test]
    fn test_non_ts_payload_ineligible() {
        assert_eq!(elide(b"not a transport stream"), None);
        // Right length, wrong sync.
        let mut block = ts_block(&[TS_NULL_PID]);
        block[0] = 0x00;
        assert_eq!(elide(&block), None);
        assert_eq!(elide(&[]), None);
    }

    #[test]
    fn test_oversized_block_ineligible() {
        let block = ts_block(&[TS_NULL_PID; 9]);
        assert_eq!(elide(&block), None);
    }

    #[test]
    fn test_seven_cell_datagram() {
        // The standard 1316-byte datagram: seven cells.
        let block = ts_block(&[0x100, 0x100, TS_NULL_PID, 0x100, 0x100, TS_NULL_PID, 0x100]);
        assert_eq!(block.len(), 1316);
        let (kept, map) = elide(&block).unwrap();
        assert_eq!(kept.len(), 5 * TS_CELL);
        assert_eq!(map, 0b0100100);
        assert_eq!(reinsert(&kept, map), {
            let mut expected = Vec::new();
            for (i, &pid) in [0x100u16, 0x100, TS_NULL_PID, 0x100, 0x100, TS_NULL_PID, 0x100]
                .iter()
                .enumerate()
            {
                if pid == TS_NULL_PID {
                    expected.extend_from_slice(&{
                        let mut cell = [0xFFu8; TS_CELL];
                        cell[0] = TS_SYNC;
                        cell[1] = 0x1F;
                        cell[2] = 0xFF;
                        cell[3] = 0x10;
                        cell
                    });
                } else {
                    expected.extend_from_slice(&data_cell(pid, i as u8));
                }
            }
            expected
        });
    }
}
