// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! CPU performance monitor ABI
//!
//! Types shared with the userspace cpu-trace driver: the per-CPU trace
//! buffer layout and the staged-configuration layout. The buffer format is
//! bit-exact; the driver maps the buffer read-only and walks it with these
//! same definitions.

use core::mem::size_of;

/// ============================================================================
/// Event ids
/// ============================================================================

/// Opaque event id chosen by the userspace driver.
///
/// The kernel only interprets the unit sub-field (to route fixed-counter ids
/// through the hardware register table); everything else is carried through
/// to the trace buffer unmodified.
pub type EventId = u32;

/// Id of an unused counter slot.
pub const EVENT_ID_NONE: EventId = 0;

const EVENT_ID_UNIT_SHIFT: u32 = 10;
const EVENT_ID_UNIT_MASK: u32 = 0x3f;
const EVENT_ID_EVENT_MASK: u32 = 0x3ff;

/// Counter unit: programmable (architectural or model-specific) counters.
pub const UNIT_PROGRAMMABLE: u32 = 0;
/// Counter unit: fixed-function counters.
pub const UNIT_FIXED: u32 = 1;

/// Compose an event id from a unit and an event number.
pub const fn make_event_id(unit: u32, event: u32) -> EventId {
    (unit << EVENT_ID_UNIT_SHIFT) | (event & EVENT_ID_EVENT_MASK)
}

/// Extract the unit sub-field of an event id.
pub const fn event_id_unit(id: EventId) -> u32 {
    (id >> EVENT_ID_UNIT_SHIFT) & EVENT_ID_UNIT_MASK
}

/// Extract the event sub-field of an event id.
pub const fn event_id_event(id: EventId) -> u32 {
    id & EVENT_ID_EVENT_MASK
}

/// Fixed-counter event ids.
///
/// The event numbers here are ABI; the hardware register each one lives in
/// comes from the fixed-counter table in the validator.
pub const FIXED_INSTRUCTIONS_RETIRED: EventId = make_event_id(UNIT_FIXED, 1);
pub const FIXED_UNHALTED_CORE_CYCLES: EventId = make_event_id(UNIT_FIXED, 2);
pub const FIXED_UNHALTED_REFERENCE_CYCLES: EventId = make_event_id(UNIT_FIXED, 3);

/// ============================================================================
/// Configuration
/// ============================================================================

/// Maximum number of fixed counter slots in a configuration.
pub const IPM_MAX_FIXED_COUNTERS: usize = 8;

/// Maximum number of programmable counter slots in a configuration.
pub const IPM_MAX_PROGRAMMABLE_COUNTERS: usize = 8;

/// Maximum total counters, used to size the buffer floor.
pub const CPUPERF_MAX_COUNTERS: usize =
    IPM_MAX_FIXED_COUNTERS + IPM_MAX_PROGRAMMABLE_COUNTERS;

bitflags::bitflags! {
    /// Per-counter configuration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigFlags: u32 {
        /// Counter is sampled when the timebase counter overflows, not on
        /// its own overflow.
        const TIMEBASE = 1 << 0;

        /// Emit the interrupted program counter on overflow.
        const PC = 1 << 1;
    }
}

/// All flag bits a configuration may set.
pub const IPM_CONFIG_FLAG_MASK: u32 = ConfigFlags::all().bits();

/// The staged performance monitor configuration, supplied by the userspace
/// driver and validated before any of it reaches hardware.
///
/// Active entries in the id arrays are front-packed: `ids[0..N)` are
/// non-zero, `ids[N..)` are zero, and every per-slot field of an unused
/// slot is zero.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct PmuConfig {
    /// IA32_PERF_GLOBAL_CTRL value while collection runs.
    pub global_ctrl: u64,

    /// IA32_FIXED_CTR_CTRL value while collection runs.
    pub fixed_ctrl: u64,

    /// IA32_DEBUGCTL value while collection runs.
    pub debug_ctrl: u64,

    /// Sampling timebase event id, or `EVENT_ID_NONE`.
    pub timebase_id: EventId,

    /// Ids of the fixed counters in use.
    pub fixed_ids: [EventId; IPM_MAX_FIXED_COUNTERS],

    /// Initial value of each fixed counter.
    pub fixed_initial_value: [u64; IPM_MAX_FIXED_COUNTERS],

    /// `ConfigFlags` bits for each fixed counter.
    pub fixed_flags: [u32; IPM_MAX_FIXED_COUNTERS],

    /// Ids of the programmable counters in use.
    pub programmable_ids: [EventId; IPM_MAX_PROGRAMMABLE_COUNTERS],

    /// IA32_PERFEVTSEL value for each programmable counter.
    pub programmable_events: [u64; IPM_MAX_PROGRAMMABLE_COUNTERS],

    /// Initial value of each programmable counter.
    pub programmable_initial_value: [u64; IPM_MAX_PROGRAMMABLE_COUNTERS],

    /// `ConfigFlags` bits for each programmable counter.
    pub programmable_flags: [u32; IPM_MAX_PROGRAMMABLE_COUNTERS],
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self {
            global_ctrl: 0,
            fixed_ctrl: 0,
            debug_ctrl: 0,
            timebase_id: EVENT_ID_NONE,
            fixed_ids: [EVENT_ID_NONE; IPM_MAX_FIXED_COUNTERS],
            fixed_initial_value: [0; IPM_MAX_FIXED_COUNTERS],
            fixed_flags: [0; IPM_MAX_FIXED_COUNTERS],
            programmable_ids: [EVENT_ID_NONE; IPM_MAX_PROGRAMMABLE_COUNTERS],
            programmable_events: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
            programmable_initial_value: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
            programmable_flags: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
        }
    }
}

/// Hardware properties reported to the userspace driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PmuProperties {
    /// Performance monitor architectural version.
    pub pm_version: u32,

    /// Number of fixed counters on this part.
    pub num_fixed_counters: u32,

    /// Number of programmable counters on this part.
    pub num_programmable_counters: u32,

    /// Width of the fixed counters, in bits.
    pub fixed_counter_width: u32,

    /// Width of the programmable counters, in bits.
    pub programmable_counter_width: u32,

    /// IA32_PERF_CAPABILITIES, or zero if not reported.
    pub perf_capabilities: u32,
}

/// ============================================================================
/// Trace buffer format
/// ============================================================================

/// Buffer format version.
pub const CPUPERF_BUFFER_VERSION: u32 = 0;

/// Buffer architecture tags.
pub const CPUPERF_BUFFER_ARCH_UNKNOWN: u32 = 0;
pub const CPUPERF_BUFFER_ARCH_X86_64: u32 = 1;

bitflags::bitflags! {
    /// Buffer header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// The buffer filled up; records were dropped and the counters are
        /// disarmed until the next stop/start.
        const FULL = 1 << 0;
    }
}

/// Header at offset zero of every per-CPU trace buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferHeader {
    /// `CPUPERF_BUFFER_VERSION`.
    pub version: u32,

    /// `CPUPERF_BUFFER_ARCH_*`.
    pub arch: u32,

    /// `BufferFlags` bits.
    pub flags: u32,

    pub reserved: u32,

    /// Unit of record timestamps.
    pub ticks_per_second: u64,

    /// Byte offset of the first unused byte.
    pub capture_end: u64,
}

/// Record type discriminators.
pub const CPUPERF_RECORD_RESERVED: u8 = 0;
pub const CPUPERF_RECORD_TICK: u8 = 1;
pub const CPUPERF_RECORD_VALUE: u8 = 2;
pub const CPUPERF_RECORD_PC: u8 = 3;

/// Common prefix of every trace record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    /// `CPUPERF_RECORD_*`.
    pub record_type: u8,

    pub reserved_flags: u8,

    /// Event id of the counter this record describes.
    pub event: u16,

    pub reserved: u32,

    /// Timestamp, in `ticks_per_second` units.
    pub time: u64,
}

/// "The counter overflowed."
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TickRecord {
    pub header: RecordHeader,
}

/// "The counter's current value is `value`."
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ValueRecord {
    pub header: RecordHeader,
    pub value: u64,
}

/// "The counter overflowed at `pc` in address space `aspace`."
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PcRecord {
    pub header: RecordHeader,
    pub aspace: u64,
    pub pc: u64,
}

/// Size of the largest record; the space check in the interrupt handler
/// reserves this much per counter rather than tracking per-type sizes.
pub const MAX_RECORD_SIZE: usize = size_of::<PcRecord>();

// The wire layout is load-bearing for the userspace driver.
const _: () = assert!(size_of::<BufferHeader>() == 32);
const _: () = assert!(size_of::<RecordHeader>() == 16);
const _: () = assert!(size_of::<TickRecord>() == 16);
const _: () = assert!(size_of::<ValueRecord>() == 24);
const _: () = assert!(size_of::<PcRecord>() == 32);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_packing() {
        let id = make_event_id(UNIT_FIXED, 3);
        assert_eq!(event_id_unit(id), UNIT_FIXED);
        assert_eq!(event_id_event(id), 3);
        assert_eq!(event_id_unit(EVENT_ID_NONE), UNIT_PROGRAMMABLE);
        // Valid ids fit the record header's 16-bit event field.
        assert!(FIXED_UNHALTED_REFERENCE_CYCLES <= u16::MAX as u32);
    }

    #[test]
    fn config_flag_mask() {
        assert_eq!(IPM_CONFIG_FLAG_MASK, 0x3);
        assert!(ConfigFlags::from_bits(0x4).is_none());
        assert_eq!(
            ConfigFlags::from_bits(0x3).unwrap(),
            ConfigFlags::TIMEBASE | ConfigFlags::PC
        );
    }

    #[test]
    fn default_config_is_all_unused() {
        let cfg = PmuConfig::default();
        assert!(cfg.fixed_ids.iter().all(|&id| id == EVENT_ID_NONE));
        assert!(cfg.programmable_ids.iter().all(|&id| id == EVENT_ID_NONE));
        assert_eq!(cfg.timebase_id, EVENT_ID_NONE);
    }
}
