// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Trace record encoder
//!
//! Writers for the three record types. Each takes the current write cursor,
//! writes one header-prefixed fixed-layout record, and returns the advanced
//! cursor. Callers bound the cursor before writing; the PMI handler does one
//! worst-case space check per interrupt rather than one per record.

use crate::cpuperf::{
    EventId, PcRecord, RecordHeader, TickRecord, ValueRecord, CPUPERF_RECORD_PC,
    CPUPERF_RECORD_TICK, CPUPERF_RECORD_VALUE,
};

fn record_header(record_type: u8, event: EventId, time: u64) -> RecordHeader {
    RecordHeader {
        record_type,
        reserved_flags: 0,
        event: event as u16,
        reserved: 0,
        time,
    }
}

/// Write a tick record at `next`.
///
/// # Safety
///
/// `next` must point to at least `size_of::<TickRecord>()` writable bytes.
pub unsafe fn write_tick_record(next: *mut u8, counter: EventId, time: u64) -> *mut u8 {
    let rec = TickRecord {
        header: record_header(CPUPERF_RECORD_TICK, counter, time),
    };
    next.cast::<TickRecord>().write_unaligned(rec);
    next.add(core::mem::size_of::<TickRecord>())
}

/// Write a value record at `next`.
///
/// # Safety
///
/// `next` must point to at least `size_of::<ValueRecord>()` writable bytes.
pub unsafe fn write_value_record(
    next: *mut u8,
    counter: EventId,
    time: u64,
    value: u64,
) -> *mut u8 {
    let rec = ValueRecord {
        header: record_header(CPUPERF_RECORD_VALUE, counter, time),
        value,
    };
    next.cast::<ValueRecord>().write_unaligned(rec);
    next.add(core::mem::size_of::<ValueRecord>())
}

/// Write a pc record at `next`.
///
/// # Safety
///
/// `next` must point to at least `size_of::<PcRecord>()` writable bytes.
pub unsafe fn write_pc_record(
    next: *mut u8,
    counter: EventId,
    time: u64,
    aspace: u64,
    pc: u64,
) -> *mut u8 {
    let rec = PcRecord {
        header: record_header(CPUPERF_RECORD_PC, counter, time),
        aspace,
        pc,
    };
    next.cast::<PcRecord>().write_unaligned(rec);
    next.add(core::mem::size_of::<PcRecord>())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuperf::make_event_id;

    fn le_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
    }

    fn le_u64(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn tick_record_layout() {
        let mut buf = [0xaau8; 64];
        let id = make_event_id(1, 2);
        let end = unsafe { write_tick_record(buf.as_mut_ptr(), id, 0x1122334455667788) };
        assert_eq!(end as usize - buf.as_ptr() as usize, 16);
        assert_eq!(buf[0], CPUPERF_RECORD_TICK);
        assert_eq!(buf[1], 0);
        assert_eq!(le_u16(&buf, 2), id as u16);
        assert_eq!(le_u64(&buf, 8), 0x1122334455667788);
    }

    #[test]
    fn value_record_layout() {
        let mut buf = [0u8; 64];
        let end = unsafe { write_value_record(buf.as_mut_ptr(), 7, 55, 0xdead_beef) };
        assert_eq!(end as usize - buf.as_ptr() as usize, 24);
        assert_eq!(buf[0], CPUPERF_RECORD_VALUE);
        assert_eq!(le_u64(&buf, 8), 55);
        assert_eq!(le_u64(&buf, 16), 0xdead_beef);
    }

    #[test]
    fn pc_record_layout() {
        let mut buf = [0u8; 64];
        let end = unsafe { write_pc_record(buf.as_mut_ptr(), 9, 1, 0xc000, 0xffff_8000_1000_2000) };
        assert_eq!(end as usize - buf.as_ptr() as usize, 32);
        assert_eq!(buf[0], CPUPERF_RECORD_PC);
        assert_eq!(le_u64(&buf, 16), 0xc000);
        assert_eq!(le_u64(&buf, 24), 0xffff_8000_1000_2000);
    }

    #[test]
    fn records_pack_back_to_back() {
        let mut buf = [0u8; 128];
        unsafe {
            let next = write_tick_record(buf.as_mut_ptr(), 1, 10);
            let next = write_value_record(next, 2, 11, 42);
            let end = write_pc_record(next, 3, 12, 0, 0);
            assert_eq!(end as usize - buf.as_ptr() as usize, 16 + 24 + 32);
        }
        assert_eq!(buf[0], CPUPERF_RECORD_TICK);
        assert_eq!(buf[16], CPUPERF_RECORD_VALUE);
        assert_eq!(buf[40], CPUPERF_RECORD_PC);
    }
}
