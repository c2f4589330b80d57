// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Configuration validation
//!
//! The userspace driver does its own checking, but nothing it sends is
//! trusted: a compromised driver must not be able to make us write MSR bits
//! outside the precomputed writable masks, load a counter beyond its width,
//! or walk off the end of the counter arrays. Every check here is a pure
//! function of the capabilities and the candidate configuration; rejection
//! leaves the session untouched.

use crate::caps::HardwareCaps;
use crate::cpuperf::{
    event_id_event, event_id_unit, EventId, PmuConfig, FIXED_INSTRUCTIONS_RETIRED,
    FIXED_UNHALTED_CORE_CYCLES, FIXED_UNHALTED_REFERENCE_CYCLES, IPM_CONFIG_FLAG_MASK,
    IPM_MAX_FIXED_COUNTERS, UNIT_FIXED,
};
use crate::msr::IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI_MASK;
use crate::types::{Result, ERR_INVALID_ARGS};
use crate::TRACEF;

/// Hardware register number for each fixed event, keyed by the event
/// sub-field of the id.
static FIXED_COUNTER_TABLE: &[(u32, u32)] = &[
    (event_id_event(FIXED_INSTRUCTIONS_RETIRED), 0),
    (event_id_event(FIXED_UNHALTED_CORE_CYCLES), 1),
    (event_id_event(FIXED_UNHALTED_REFERENCE_CYCLES), 2),
];

/// Return the h/w register number for fixed event id `id`,
/// or `IPM_MAX_FIXED_COUNTERS` if not found.
pub fn lookup_fixed_counter(id: EventId) -> u32 {
    if event_id_unit(id) != UNIT_FIXED {
        return IPM_MAX_FIXED_COUNTERS as u32;
    }
    let event = event_id_event(id);
    for &(table_event, regnum) in FIXED_COUNTER_TABLE {
        if event == table_event {
            return regnum;
        }
    }
    IPM_MAX_FIXED_COUNTERS as u32
}

/// Check the control register values against the writable masks.
pub fn verify_control_config(caps: &HardwareCaps, config: &PmuConfig) -> Result {
    if cfg!(feature = "freeze-on-pmi") {
        if config.debug_ctrl & IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI_MASK == 0 {
            TRACEF!("IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI not set");
            return Err(ERR_INVALID_ARGS);
        }
    } else if config.debug_ctrl & IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI_MASK != 0 {
        TRACEF!("IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI is set");
        return Err(ERR_INVALID_ARGS);
    }

    if config.global_ctrl & !caps.global_ctrl_writable != 0 {
        TRACEF!("Non writable bits set in global_ctrl");
        return Err(ERR_INVALID_ARGS);
    }
    if config.fixed_ctrl & !caps.fixed_ctrl_writable != 0 {
        TRACEF!("Non writable bits set in fixed_ctrl");
        return Err(ERR_INVALID_ARGS);
    }
    if config.debug_ctrl & !caps.debug_ctrl_writable != 0 {
        TRACEF!("Non writable bits set in debug_ctrl");
        return Err(ERR_INVALID_ARGS);
    }

    Ok(())
}

/// Check the fixed counter slots; on success return the number in use.
///
/// Active slots must be a front-packed prefix, every field of an unused
/// slot must be zero, and each active id must resolve to a hardware
/// register.
pub fn verify_fixed_config(caps: &HardwareCaps, config: &PmuConfig) -> Result<u32> {
    let mut seen_last = false;
    let mut num_used = caps.num_fixed;
    for i in 0..caps.num_fixed as usize {
        let id = config.fixed_ids[i];
        if id != 0 && seen_last {
            TRACEF!("Active fixed events not front-filled");
            return Err(ERR_INVALID_ARGS);
        }
        if id == 0 {
            if !seen_last {
                num_used = i as u32;
            }
            seen_last = true;
        }
        if seen_last {
            if config.fixed_initial_value[i] != 0 {
                TRACEF!("Unused fixed_initial_value[{}] not zero", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.fixed_flags[i] != 0 {
                TRACEF!("Unused fixed_flags[{}] not zero", i);
                return Err(ERR_INVALID_ARGS);
            }
        } else {
            if config.fixed_initial_value[i] > caps.max_fixed_value {
                TRACEF!("Initial value too large for fixed_initial_value[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.fixed_flags[i] & !IPM_CONFIG_FLAG_MASK != 0 {
                TRACEF!("Unused bits set in fixed_flags[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
            let hw_regnum = lookup_fixed_counter(id);
            if hw_regnum == IPM_MAX_FIXED_COUNTERS as u32 {
                TRACEF!("Invalid fixed counter id fixed_ids[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
        }
    }

    Ok(num_used)
}

/// Check the programmable counter slots; on success return the number in
/// use. Same shape as the fixed check, plus the event-select mask.
pub fn verify_programmable_config(caps: &HardwareCaps, config: &PmuConfig) -> Result<u32> {
    let mut seen_last = false;
    let mut num_used = caps.num_programmable;
    for i in 0..caps.num_programmable as usize {
        let id = config.programmable_ids[i];
        if id != 0 && seen_last {
            TRACEF!("Active programmable events not front-filled");
            return Err(ERR_INVALID_ARGS);
        }
        if id == 0 {
            if !seen_last {
                num_used = i as u32;
            }
            seen_last = true;
        }
        if seen_last {
            if config.programmable_events[i] != 0 {
                TRACEF!("Unused programmable_events[{}] not zero", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.programmable_initial_value[i] != 0 {
                TRACEF!("Unused programmable_initial_value[{}] not zero", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.programmable_flags[i] != 0 {
                TRACEF!("Unused programmable_flags[{}] not zero", i);
                return Err(ERR_INVALID_ARGS);
            }
        } else {
            if config.programmable_events[i] & !caps.event_select_writable != 0 {
                TRACEF!("Non writable bits set in programmable_events[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.programmable_initial_value[i] > caps.max_programmable_value {
                TRACEF!("Initial value too large for programmable_initial_value[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
            if config.programmable_flags[i] & !IPM_CONFIG_FLAG_MASK != 0 {
                TRACEF!("Unused bits set in programmable_flags[{}]", i);
                return Err(ERR_INVALID_ARGS);
            }
        }
    }

    Ok(num_used)
}

// ============================================================================
// Tests
// ============================================================================
