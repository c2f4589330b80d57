// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Performance monitor core
//!
//! The ring-zero half of CPU performance monitoring: the session state
//! machine driven by the userspace cpu-trace driver, the per-CPU broadcast
//! tasks that program the counter MSRs, and the PMI handler that streams
//! sampled records into the per-CPU trace buffers.
//!
//! Code defaults to the userspace driver; it lands here only when it needs
//! ring zero (MSR access), and everything the driver hands us is validated
//! so a compromised driver cannot compromise the kernel.
//!
//! # Locking
//!
//! One mutex serialises every state transition. The PMI handler cannot
//! block, so it is kept off the mutex entirely: it reads the session
//! through a published pointer, gated by the `active` flag. `start` flips
//! the flag on only after every CPU is programmed and every buffer is
//! mapped; `stop` flips it off before it touches anything a straggling PMI
//! could trip over. Within a per-CPU slot no further synchronisation is
//! needed: the slot belongs to the control thread while collection is off
//! and to its own CPU while collection runs.

use crate::arch::amd64::X86Iframe;
use crate::arch::{HandlerReturn, PerfmonHw};
use crate::caps::HardwareCaps;
use crate::cpuperf::{
    BufferFlags, BufferHeader, ConfigFlags, EventId, PmuConfig, PmuProperties,
    CPUPERF_BUFFER_ARCH_X86_64, CPUPERF_BUFFER_VERSION, CPUPERF_MAX_COUNTERS, EVENT_ID_NONE,
    IPM_MAX_FIXED_COUNTERS, IPM_MAX_PROGRAMMABLE_COUNTERS, MAX_RECORD_SIZE,
};
use crate::msr::*;
use crate::records::{write_pc_record, write_tick_record, write_value_record};
use crate::types::{
    CpuId, Result, ERR_BAD_STATE, ERR_INVALID_ARGS, ERR_NOT_SUPPORTED, ERR_NO_MEMORY,
};
use crate::validate::{
    lookup_fixed_counter, verify_control_config, verify_fixed_config, verify_programmable_config,
};
use crate::vmo::{RefPtr, VmMapping, VmObject};
use crate::{LTRACEF, TRACEF};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use spin::Mutex;

const LOCAL_TRACE: bool = false;

/// ============================================================================
/// Session state
/// ============================================================================

/// Per-CPU collection state.
#[repr(align(64))]
pub struct PerfmonCpuData {
    /// The trace buffer, passed in from userspace.
    buffer_vmo: Option<RefPtr<dyn VmObject>>,
    buffer_size: usize,

    /// The trace buffer when mapped into kernel space.
    /// This is only done while the trace is running.
    buffer_mapping: Option<VmMapping>,
    buffer_start: *mut BufferHeader,
    buffer_end: *mut u8,

    /// The next record to fill.
    buffer_next: *mut u8,

    /// PMIs taken on this CPU during this session.
    perf_ints: u64,
}

impl PerfmonCpuData {
    fn new() -> Self {
        Self {
            buffer_vmo: None,
            buffer_size: 0,
            buffer_mapping: None,
            buffer_start: ptr::null_mut(),
            buffer_end: ptr::null_mut(),
            buffer_next: ptr::null_mut(),
            perf_ints: 0,
        }
    }
}

/// The staged session: validated configuration plus one slot per CPU.
pub struct PerfmonState {
    // IA32_PERF_GLOBAL_CTRL
    global_ctrl: u64,

    // IA32_FIXED_CTR_CTRL
    fixed_ctrl: u64,

    // IA32_DEBUGCTL
    debug_ctrl: u64,

    // The sampling timebase event, or EVENT_ID_NONE.
    timebase_id: EventId,

    // The number of each kind of counter in use, so we don't have to
    // iterate over the entire arrays.
    num_used_fixed: u32,
    num_used_programmable: u32,

    // Number of entries in |cpu_data|.
    num_cpus: u32,

    // One entry per CPU. Only ever accessed by the slot's owner; see the
    // module comment on locking.
    cpu_data: Box<[UnsafeCell<PerfmonCpuData>]>,

    // |fixed_hw_map[i]| is the h/w fixed counter number for |fixed_ids[i]|,
    // so we only ever touch fixed counters that are in use.
    fixed_hw_map: [u32; IPM_MAX_FIXED_COUNTERS],

    // The counters are reset to these at the start, and again on overflow.
    fixed_initial_value: [u64; IPM_MAX_FIXED_COUNTERS],
    programmable_initial_value: [u64; IPM_MAX_PROGRAMMABLE_COUNTERS],

    // ConfigFlags bits for each counter.
    fixed_flags: [u32; IPM_MAX_FIXED_COUNTERS],
    programmable_flags: [u32; IPM_MAX_PROGRAMMABLE_COUNTERS],

    // The ids of the in-use counters, or zero if not used. These come from
    // the driver and are written to the buffer, but otherwise have no
    // meaning to us. All in-use entries appear consecutively.
    fixed_ids: [EventId; IPM_MAX_FIXED_COUNTERS],
    programmable_ids: [EventId; IPM_MAX_PROGRAMMABLE_COUNTERS],

    // IA32_PERFEVTSEL_* values.
    events: [u64; IPM_MAX_PROGRAMMABLE_COUNTERS],
}

// The per-CPU slots hold raw buffer pointers. Each slot is only touched by
// the control thread (session mutex held, collection inactive) or by its
// own CPU's broadcast task and PMI handler (collection active); the active
// flag hands ownership between the two.
unsafe impl Send for PerfmonState {}
unsafe impl Sync for PerfmonState {}

impl PerfmonState {
    fn create(num_cpus: u32) -> Result<Box<PerfmonState>> {
        let mut cpu_data = Vec::new();
        cpu_data
            .try_reserve_exact(num_cpus as usize)
            .map_err(|_| ERR_NO_MEMORY)?;
        for _ in 0..num_cpus {
            cpu_data.push(UnsafeCell::new(PerfmonCpuData::new()));
        }

        Ok(Box::new(PerfmonState {
            global_ctrl: 0,
            fixed_ctrl: 0,
            debug_ctrl: 0,
            timebase_id: EVENT_ID_NONE,
            num_used_fixed: 0,
            num_used_programmable: 0,
            num_cpus,
            cpu_data: cpu_data.into_boxed_slice(),
            fixed_hw_map: [0; IPM_MAX_FIXED_COUNTERS],
            fixed_initial_value: [0; IPM_MAX_FIXED_COUNTERS],
            programmable_initial_value: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
            fixed_flags: [0; IPM_MAX_FIXED_COUNTERS],
            programmable_flags: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
            fixed_ids: [EVENT_ID_NONE; IPM_MAX_FIXED_COUNTERS],
            programmable_ids: [EVENT_ID_NONE; IPM_MAX_PROGRAMMABLE_COUNTERS],
            events: [0; IPM_MAX_PROGRAMMABLE_COUNTERS],
        }))
    }

    fn cpu_data_mut(&mut self, cpu: CpuId) -> &mut PerfmonCpuData {
        self.cpu_data[cpu as usize].get_mut()
    }

    /// Raw slot pointer, for the contexts that own the slot without holding
    /// the session mutex (the owning CPU's broadcast task or PMI handler).
    unsafe fn cpu_data_raw(&self, cpu: CpuId) -> *mut PerfmonCpuData {
        self.cpu_data[cpu as usize].get()
    }
}

/// Delta a counter advanced from `initial` to `current`, treating
/// `current < initial` as a single wrap of a counter capped at `max_value`.
fn counter_delta(current: u64, initial: u64, max_value: u64) -> u64 {
    if current >= initial {
        current - initial
    } else {
        // The max counter value is generally not 64 bits.
        current + (max_value - initial + 1)
    }
}

/// ============================================================================
/// The subsystem
/// ============================================================================

/// The performance monitor subsystem.
///
/// One instance exists per machine; see [`crate::arch::amd64`] for the boot
/// wiring. The type is generic over [`PerfmonHw`] so the whole state
/// machine, including the interrupt path, runs against a fake machine in
/// tests.
pub struct Perfmon<H: PerfmonHw> {
    hw: H,

    /// Probed once at construction; `None` means unsupported hardware.
    caps: Option<HardwareCaps>,

    /// The session, guarded by the one state-transition mutex.
    session: Mutex<Option<Box<PerfmonState>>>,

    /// Unlocked view of the session for the PMI handler. Non-null from
    /// `init` to `fini`; only dereferenced while `active` is observed true.
    session_ptr: AtomicPtr<PerfmonState>,

    /// True while every CPU is programmed and every buffer is mapped.
    active: AtomicBool,
}

impl<H: PerfmonHw> Perfmon<H> {
    /// Probe the hardware and construct the subsystem.
    pub fn new(hw: H) -> Self {
        let caps = HardwareCaps::probe(&hw);
        if caps.is_none() {
            TRACEF!("perfmon: not supported on this hardware");
        }
        Self {
            hw,
            caps,
            session: Mutex::new(None),
            session_ptr: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(false),
        }
    }

    fn caps(&self) -> Result<&HardwareCaps> {
        self.caps.as_ref().ok_or(ERR_NOT_SUPPORTED)
    }

    /// The backing hardware interface.
    pub fn hw(&self) -> &H {
        &self.hw
    }

    /// Whether collection is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// PMIs taken on `cpu` during the current session.
    pub fn pmi_count(&self, cpu: CpuId) -> Result<u64> {
        let mut session = self.session.lock();
        let state = session.as_deref_mut().ok_or(ERR_BAD_STATE)?;
        if cpu >= state.num_cpus {
            return Err(ERR_INVALID_ARGS);
        }
        Ok(state.cpu_data_mut(cpu).perf_ints)
    }

    /// ------------------------------------------------------------------------
    /// Control surface
    /// ------------------------------------------------------------------------

    /// Report the hardware's performance monitoring properties.
    pub fn get_properties(&self) -> Result<PmuProperties> {
        let _session = self.session.lock();
        let caps = self.caps()?;
        Ok(PmuProperties {
            pm_version: caps.version,
            num_fixed_counters: caps.num_fixed,
            num_programmable_counters: caps.num_programmable,
            fixed_counter_width: caps.fixed_width,
            programmable_counter_width: caps.programmable_width,
            perf_capabilities: caps.capabilities,
        })
    }

    /// Create the session.
    pub fn init(&self) -> Result {
        let mut session = self.session.lock();
        self.caps()?;
        if self.active.load(Ordering::Acquire) {
            return Err(ERR_BAD_STATE);
        }
        if session.is_some() {
            return Err(ERR_BAD_STATE);
        }

        let mut state = PerfmonState::create(self.hw.max_num_cpus())?;
        let raw = &mut *state as *mut PerfmonState;
        *session = Some(state);
        self.session_ptr.store(raw, Ordering::Release);
        Ok(())
    }

    /// Assign `vmo` as the trace buffer for `cpu`.
    pub fn assign_buffer(&self, cpu: CpuId, vmo: RefPtr<dyn VmObject>) -> Result {
        let mut session = self.session.lock();
        self.caps()?;
        if self.active.load(Ordering::Acquire) {
            return Err(ERR_BAD_STATE);
        }
        let state = session.as_deref_mut().ok_or(ERR_BAD_STATE)?;
        if cpu >= state.num_cpus {
            return Err(ERR_INVALID_ARGS);
        }

        // A simple safe approximation of the minimum size needed.
        let min_size_needed = size_of::<BufferHeader>() + CPUPERF_MAX_COUNTERS * MAX_RECORD_SIZE;
        if vmo.size() < min_size_needed {
            return Err(ERR_INVALID_ARGS);
        }

        let data = state.cpu_data_mut(cpu);
        data.buffer_size = vmo.size();
        data.buffer_vmo = Some(vmo);
        // The buffer is mapped into kernelspace later.

        Ok(())
    }

    /// Stage `config` for later activation by `start`.
    ///
    /// The main job here is verifying the config is ok, e.g. that it won't
    /// cause us to crash.
    pub fn stage_config(&self, config: &PmuConfig) -> Result {
        let mut session = self.session.lock();
        let caps = self.caps()?;
        if self.active.load(Ordering::Acquire) {
            return Err(ERR_BAD_STATE);
        }
        let state = session.as_deref_mut().ok_or(ERR_BAD_STATE)?;

        verify_control_config(caps, config)?;
        let num_used_fixed = verify_fixed_config(caps, config)?;
        let num_used_programmable = verify_programmable_config(caps, config)?;

        state.num_used_fixed = num_used_fixed;
        state.num_used_programmable = num_used_programmable;

        state.global_ctrl = config.global_ctrl;
        state.fixed_ctrl = config.fixed_ctrl;
        state.debug_ctrl = config.debug_ctrl;
        state.timebase_id = config.timebase_id;
        state.events = config.programmable_events;
        state.programmable_initial_value = config.programmable_initial_value;
        state.fixed_initial_value = config.fixed_initial_value;
        state.programmable_flags = config.programmable_flags;
        state.fixed_flags = config.fixed_flags;
        state.programmable_ids = config.programmable_ids;
        state.fixed_ids = config.fixed_ids;

        for i in 0..IPM_MAX_FIXED_COUNTERS {
            state.fixed_hw_map[i] = lookup_fixed_counter(config.fixed_ids[i]);
        }

        Ok(())
    }

    /// Begin collecting data.
    pub fn start(&self) -> Result {
        let mut session = self.session.lock();
        self.caps()?;
        if self.active.load(Ordering::Acquire) {
            return Err(ERR_BAD_STATE);
        }
        let state = session.as_deref_mut().ok_or(ERR_BAD_STATE)?;

        // Map the buffers in now, not at assign time, so they stay mapped
        // only as long as necessary.
        self.map_buffers_locked(state)?;

        TRACEF!(
            "Enabling perfmon, {} fixed, {} programmable",
            state.num_used_fixed,
            state.num_used_programmable
        );
        if LOCAL_TRACE {
            LTRACEF!(
                "global ctrl: {:#x}, fixed ctrl: {:#x}",
                state.global_ctrl,
                state.fixed_ctrl
            );
            for i in 0..state.num_used_fixed as usize {
                LTRACEF!(
                    "fixed[{}]: num {}, initial {:#x}",
                    i,
                    state.fixed_hw_map[i],
                    state.fixed_initial_value[i]
                );
            }
            for i in 0..state.num_used_programmable as usize {
                LTRACEF!(
                    "programmable[{}]: id {:#x}, initial {:#x}",
                    i,
                    state.programmable_ids[i],
                    state.programmable_initial_value[i]
                );
            }
        }

        let state_ref: &PerfmonState = state;
        self.hw.sync_exec(&|_cpu| self.start_cpu_task(state_ref));
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop collecting data. Ok to call multiple times; fails before `init`
    /// and after `fini`.
    pub fn stop(&self) -> Result {
        let mut session = self.session.lock();
        self.caps()?;
        let state = session.as_deref_mut().ok_or(ERR_BAD_STATE)?;

        TRACEF!("Disabling perfmon");

        // Do this before anything else so that any PMI from this point on
        // won't try to access potentially unmapped memory.
        self.active.store(false, Ordering::Release);

        let state_ref: &PerfmonState = state;
        self.hw
            .sync_exec(&|cpu| unsafe { self.stop_cpu_task(state_ref, cpu) });

        // `start` maps the buffers in, so unmap them here. This runs after
        // everything is off on every CPU, so no PMI can follow.
        Self::unmap_buffers_locked(state);

        Ok(())
    }

    /// Reset the hardware and undo everything `init` did.
    /// Must be called while collection is stopped.
    pub fn fini(&self) -> Result {
        let mut session = self.session.lock();
        self.caps()?;
        if self.active.load(Ordering::Acquire) {
            return Err(ERR_BAD_STATE);
        }
        if session.is_none() {
            return Err(ERR_BAD_STATE);
        }

        self.hw.sync_exec(&|_cpu| self.reset_task());

        self.session_ptr.store(ptr::null_mut(), Ordering::Release);
        *session = None;
        Ok(())
    }

    /// ------------------------------------------------------------------------
    /// Buffer mapping
    /// ------------------------------------------------------------------------

    fn map_buffers_locked(&self, state: &mut PerfmonState) -> Result {
        let mut status = Ok(());
        for cpu in 0..state.num_cpus {
            let ticks_per_second = self.hw.ticks_per_second();
            let data = state.cpu_data_mut(cpu);
            let Some(vmo) = data.buffer_vmo.as_ref() else {
                TRACEF!("no buffer assigned: cpu {}", cpu);
                status = Err(ERR_BAD_STATE);
                break;
            };
            // Pages are committed and mapped up front so that no fault can
            // happen in the PMI handler.
            let mapping = match vmo.map() {
                Ok(mapping) => mapping,
                Err(err) => {
                    TRACEF!(
                        "error {} mapping buffer: cpu {}, size {:#x}",
                        err,
                        cpu,
                        data.buffer_size
                    );
                    status = Err(err);
                    break;
                }
            };

            let base = mapping.base();
            data.buffer_start = base.cast::<BufferHeader>();
            data.buffer_mapping = Some(mapping);
            unsafe {
                data.buffer_end = base.add(data.buffer_size);
                let hdr = &mut *data.buffer_start;
                hdr.version = CPUPERF_BUFFER_VERSION;
                hdr.arch = CPUPERF_BUFFER_ARCH_X86_64;
                hdr.flags = 0;
                hdr.reserved = 0;
                hdr.ticks_per_second = ticks_per_second;
                hdr.capture_end = size_of::<BufferHeader>() as u64;
                data.buffer_next = base.add(size_of::<BufferHeader>());
            }
            LTRACEF!(
                "buffer mapped: cpu {}, start {:p}, end {:p}",
                cpu,
                data.buffer_start,
                data.buffer_end
            );
        }
        if status.is_err() {
            Self::unmap_buffers_locked(state);
        }
        status
    }

    fn unmap_buffers_locked(state: &mut PerfmonState) {
        for cpu in 0..state.num_cpus {
            let data = state.cpu_data_mut(cpu);
            data.buffer_mapping = None;
            data.buffer_start = ptr::null_mut();
            data.buffer_end = ptr::null_mut();
            data.buffer_next = ptr::null_mut();
        }
    }

    /// ------------------------------------------------------------------------
    /// Per-CPU broadcast tasks
    /// ------------------------------------------------------------------------

    /// Program this CPU's counters from the staged state.
    ///
    /// Runs on every CPU with interrupts disabled, before the active flag
    /// is set.
    fn start_cpu_task(&self, state: &PerfmonState) {
        let hw = &self.hw;

        for i in 0..state.num_used_fixed as usize {
            let hw_num = state.fixed_hw_map[i];
            debug_assert!((hw_num as usize) < IPM_MAX_FIXED_COUNTERS);
            hw.write_msr(IA32_FIXED_CTR0 + hw_num, state.fixed_initial_value[i]);
        }
        hw.write_msr(IA32_FIXED_CTR_CTRL, state.fixed_ctrl);

        for i in 0..state.num_used_programmable as usize {
            // Ensure PERFEVTSEL.EN is zero before resetting the counter
            // value, h/w requires it (apparently even if global ctrl is
            // off). The counter must be written before EN is set to 1.
            hw.write_msr(IA32_PERFEVTSEL_FIRST + i as u32, 0);
            hw.write_msr(IA32_PMC_FIRST + i as u32, state.programmable_initial_value[i]);
            hw.write_msr(IA32_PERFEVTSEL_FIRST + i as u32, state.events[i]);
        }

        hw.write_msr(IA32_DEBUGCTL, state.debug_ctrl);

        hw.apic_pmi_unmask();

        // Enable counters as late as possible so that our own setup doesn't
        // contribute to the data.
        hw.write_msr(IA32_PERF_GLOBAL_CTRL, state.global_ctrl);
    }

    /// Retrieve this CPU's final counter values into the trace buffer and
    /// quiesce the hardware.
    ///
    /// Runs on every CPU with interrupts disabled, after the active flag
    /// has been cleared.
    ///
    /// # Safety
    ///
    /// Must only run on the CPU owning slot `cpu`, via the broadcast.
    unsafe fn stop_cpu_task(&self, state: &PerfmonState, cpu: CpuId) {
        let hw = &self.hw;

        // Disable all counters ASAP.
        hw.write_msr(IA32_PERF_GLOBAL_CTRL, 0);
        hw.apic_pmi_mask();

        debug_assert!(!self.active.load(Ordering::Relaxed));
        let Some(caps) = self.caps.as_ref() else {
            return;
        };

        let data = &mut *state.cpu_data_raw(cpu);
        let now = hw.rdtsc();

        if !data.buffer_start.is_null() {
            LTRACEF!("Collecting last data for cpu {}", cpu);
            let hdr = &mut *data.buffer_start;
            let mut next = data.buffer_next;
            let last = data.buffer_end.sub(size_of::<crate::cpuperf::ValueRecord>());

            // If a counter triggers interrupts the PMI handler continually
            // resets it to its initial value, so just always subtract out
            // the initial value and write the difference. For non-interrupt
            // counters the user normally starts at zero and gets the same
            // answer. A non-interrupt counter that wraps more than once is
            // unrecoverable; handle the wrapped-once case, which covers the
            // vast majority.
            // TODO(perfmon): counters that trigger interrupts should never
            // have an overflowed value here, but that's what is observed.

            for i in 0..state.num_used_programmable as usize {
                if next > last {
                    hdr.flags |= BufferFlags::FULL.bits();
                    break;
                }
                let id = state.programmable_ids[i];
                debug_assert!(id != EVENT_ID_NONE);
                let current = hw.read_msr(IA32_PMC_FIRST + i as u32);
                let value = counter_delta(
                    current,
                    state.programmable_initial_value[i],
                    caps.max_programmable_value,
                );
                next = write_value_record(next, id, now, value);
            }
            for i in 0..state.num_used_fixed as usize {
                if next > last {
                    hdr.flags |= BufferFlags::FULL.bits();
                    break;
                }
                let id = state.fixed_ids[i];
                debug_assert!(id != EVENT_ID_NONE);
                let hw_num = state.fixed_hw_map[i];
                debug_assert!(hw_num < caps.num_fixed);
                let current = hw.read_msr(IA32_FIXED_CTR0 + hw_num);
                let value =
                    counter_delta(current, state.fixed_initial_value[i], caps.max_fixed_value);
                next = write_value_record(next, id, now, value);
            }

            data.buffer_next = next;
            hdr.capture_end = (next as usize - data.buffer_start as usize) as u64;

            if hdr.flags & BufferFlags::FULL.bits() != 0 {
                LTRACEF!("Buffer overflow on cpu {}", cpu);
            }
        }

        self.clear_overflow_indicators();
    }

    /// Return this CPU's performance monitor to its power-on state.
    fn reset_task(&self) {
        let Some(caps) = self.caps.as_ref() else {
            return;
        };
        let hw = &self.hw;

        hw.write_msr(IA32_PERF_GLOBAL_CTRL, 0);
        hw.apic_pmi_mask();
        self.clear_overflow_indicators();

        hw.write_msr(IA32_DEBUGCTL, 0);

        for i in 0..caps.num_programmable {
            hw.write_msr(IA32_PERFEVTSEL_FIRST + i, 0);
            hw.write_msr(IA32_PMC_FIRST + i, 0);
        }

        hw.write_msr(IA32_FIXED_CTR_CTRL, 0);
        for i in 0..caps.num_fixed {
            hw.write_msr(IA32_FIXED_CTR0 + i, 0);
        }
    }

    fn clear_overflow_indicators(&self) {
        let Some(caps) = self.caps.as_ref() else {
            return;
        };
        let mut value = IA32_PERF_GLOBAL_OVF_CTRL_CLR_COND_CHGD_MASK
            | IA32_PERF_GLOBAL_OVF_CTRL_DS_BUFFER_CLR_OVF_MASK
            | IA32_PERF_GLOBAL_OVF_CTRL_UNCORE_CLR_OVF_MASK;

        // This path isn't performance critical enough to precompute this.
        for i in 0..caps.num_programmable {
            value |= ia32_perf_global_ovf_ctrl_pmc_clr_ovf_mask(i);
        }
        for i in 0..caps.num_fixed {
            value |= ia32_perf_global_ovf_ctrl_fixed_ctr_clr_ovf_mask(i);
        }

        self.hw.write_msr(IA32_PERF_GLOBAL_OVF_CTRL, value);
    }

    /// ------------------------------------------------------------------------
    /// Interrupt handling
    /// ------------------------------------------------------------------------

    /// The PMI handler. Interrupts are disabled; we're on the CPU whose
    /// counter overflowed.
    pub fn handle_pmi(&self, frame: &X86Iframe) -> HandlerReturn {
        // Gate first: a straggler PMI racing `stop` must not touch state.
        if !self.active.load(Ordering::Acquire) {
            self.hw.apic_issue_eoi();
            return HandlerReturn::NoReschedule;
        }

        // Turn all counters off as soon as possible so the ones that
        // haven't overflowed yet stop counting while we work. Otherwise,
        // once we reset the counter that overflowed the rest resume
        // counting under our feet.
        #[cfg(not(feature = "freeze-on-pmi"))]
        self.hw.write_msr(IA32_PERF_GLOBAL_CTRL, 0);

        let state = self.session_ptr.load(Ordering::Acquire);
        let (Some(caps), false) = (self.caps.as_ref(), state.is_null()) else {
            debug_assert!(false, "active perfmon without session");
            self.hw.apic_issue_eoi();
            return HandlerReturn::NoReschedule;
        };
        // The pointer stays valid while the active flag was observed true:
        // fini tears it down only after stop has cleared the flag and
        // fenced on every CPU.
        let state = unsafe { &*state };

        let success = unsafe { self.pmi_producer(frame, caps, state) };

        // EOI here, not in the caller, so we keep full control of when
        // counting resumes.
        self.hw.apic_issue_eoi();

        if success {
            // The docs suggest the re-unmask is only needed on older
            // parts, but Skylake needs it too when freeze-on-PMI is off.
            self.hw.apic_pmi_unmask();

            // The last thing we do: once written the counters count again.
            #[cfg(not(feature = "freeze-on-pmi"))]
            self.hw.write_msr(IA32_PERF_GLOBAL_CTRL, state.global_ctrl);
        } else {
            // Buffer full: leave everything turned off. The session stays
            // active; the driver sees FULL in the header.
            #[cfg(feature = "freeze-on-pmi")]
            self.hw.write_msr(IA32_PERF_GLOBAL_CTRL, 0);
        }

        HandlerReturn::NoReschedule
    }

    /// Record this PMI's overflows. Returns false if the buffer is full.
    ///
    /// # Safety
    ///
    /// Must only run from PMI context on the interrupted CPU, with the
    /// active flag observed true on entry.
    unsafe fn pmi_producer(
        &self,
        frame: &X86Iframe,
        caps: &HardwareCaps,
        state: &PerfmonState,
    ) -> bool {
        let hw = &self.hw;
        let cpu = hw.curr_cpu_num();
        let data = &mut *state.cpu_data_raw(cpu);
        data.perf_ints += 1;

        let now = hw.rdtsc();
        LTRACEF!("cpu {}: now {}", cpu, now);

        // Rather than continually checking if we have enough space, just
        // check for the maximum amount we'll need.
        let space_needed =
            (state.num_used_programmable + state.num_used_fixed) as usize * MAX_RECORD_SIZE;
        if data.buffer_next as usize + space_needed > data.buffer_end as usize {
            TRACEF!("cpu {}: @{} pmi buffer full", cpu, now);
            (*data.buffer_start).flags |= BufferFlags::FULL.bits();
            return false;
        }

        let status = hw.read_msr(IA32_PERF_GLOBAL_STATUS);
        let mut bits_to_clear: u64 = 0;
        let cr3 = hw.read_cr3();

        LTRACEF!("cpu {}: status {:#x}", cpu, status);

        if status & caps.counter_status_bits != 0 {
            if cfg!(feature = "freeze-on-pmi") {
                if status & IA32_PERF_GLOBAL_STATUS_CTR_FRZ_MASK == 0 {
                    LTRACEF!("Eh? status.CTR_FRZ not set");
                }
            } else if status & IA32_PERF_GLOBAL_STATUS_CTR_FRZ_MASK != 0 {
                LTRACEF!("Eh? status.CTR_FRZ is set");
            }

            let mut next = data.buffer_next;
            let mut saw_timebase = false;

            // We don't write "value" records here, preferring the smaller
            // "tick" record. A user tallying counts is required to
            // recognize this and apply the configured rate.

            for i in 0..state.num_used_programmable as usize {
                if status & ia32_perf_global_status_pmc_ovf_mask(i as u32) == 0 {
                    continue;
                }
                let id = state.programmable_ids[i];
                // Counters using a separate timebase are handled below; we
                // shouldn't get an interrupt from one of those.
                if id == state.timebase_id {
                    saw_timebase = true;
                } else if state.programmable_flags[i] & ConfigFlags::TIMEBASE.bits() != 0 {
                    continue;
                }
                if state.programmable_flags[i] & ConfigFlags::PC.bits() != 0 {
                    next = write_pc_record(next, id, now, cr3, frame.ip);
                } else {
                    next = write_tick_record(next, id, now);
                }
                LTRACEF!(
                    "cpu {}: resetting PMC {} to {:#x}",
                    cpu,
                    i,
                    state.programmable_initial_value[i]
                );
                hw.write_msr(IA32_PMC_FIRST + i as u32, state.programmable_initial_value[i]);
            }

            for i in 0..state.num_used_fixed as usize {
                let hw_num = state.fixed_hw_map[i];
                debug_assert!(hw_num < caps.num_fixed);
                if status & ia32_perf_global_status_fixed_ovf_mask(hw_num) == 0 {
                    continue;
                }
                let id = state.fixed_ids[i];
                if id == state.timebase_id {
                    saw_timebase = true;
                } else if state.fixed_flags[i] & ConfigFlags::TIMEBASE.bits() != 0 {
                    continue;
                }
                if state.fixed_flags[i] & ConfigFlags::PC.bits() != 0 {
                    next = write_pc_record(next, id, now, cr3, frame.ip);
                } else {
                    next = write_tick_record(next, id, now);
                }
                LTRACEF!(
                    "cpu {}: resetting FIXED {} to {:#x}",
                    cpu,
                    hw_num,
                    state.fixed_initial_value[i]
                );
                hw.write_msr(IA32_FIXED_CTR0 + hw_num, state.fixed_initial_value[i]);
            }

            bits_to_clear |= caps.counter_status_bits;

            // Now sample the counters riding on the timebase. The timebase
            // counter itself was already recorded above; skipping it here
            // keeps the up-front space check an upper bound.
            if saw_timebase {
                for i in 0..state.num_used_programmable as usize {
                    if state.programmable_flags[i] & ConfigFlags::TIMEBASE.bits() == 0 {
                        continue;
                    }
                    let id = state.programmable_ids[i];
                    if id == state.timebase_id {
                        continue;
                    }
                    let value = hw.read_msr(IA32_PMC_FIRST + i as u32);
                    next = write_value_record(next, id, now, value);
                    // We could leave the counter alone, but it could
                    // overflow; reduce the risk and reset it.
                    LTRACEF!(
                        "cpu {}: resetting PMC {} to {:#x}",
                        cpu,
                        i,
                        state.programmable_initial_value[i]
                    );
                    hw.write_msr(IA32_PMC_FIRST + i as u32, state.programmable_initial_value[i]);
                }
                for i in 0..state.num_used_fixed as usize {
                    if state.fixed_flags[i] & ConfigFlags::TIMEBASE.bits() == 0 {
                        continue;
                    }
                    let id = state.fixed_ids[i];
                    if id == state.timebase_id {
                        continue;
                    }
                    let hw_num = state.fixed_hw_map[i];
                    debug_assert!(hw_num < caps.num_fixed);
                    let value = hw.read_msr(IA32_FIXED_CTR0 + hw_num);
                    next = write_value_record(next, id, now, value);
                    LTRACEF!(
                        "cpu {}: resetting FIXED {} to {:#x}",
                        cpu,
                        hw_num,
                        state.fixed_initial_value[i]
                    );
                    hw.write_msr(IA32_FIXED_CTR0 + hw_num, state.fixed_initial_value[i]);
                }
            }

            data.buffer_next = next;
        }

        // We shouldn't be seeing these set (at least not yet).
        if status & IA32_PERF_GLOBAL_STATUS_TRACE_TOPA_PMI_MASK != 0 {
            LTRACEF!("WARNING: GLOBAL_STATUS_TRACE_TOPA_PMI set");
        }
        if status & IA32_PERF_GLOBAL_STATUS_LBR_FRZ_MASK != 0 {
            LTRACEF!("WARNING: GLOBAL_STATUS_LBR_FRZ set");
        }
        if status & IA32_PERF_GLOBAL_STATUS_DS_BUFFER_OVF_MASK != 0 {
            LTRACEF!("WARNING: GLOBAL_STATUS_DS_BUFFER_OVF set");
        }

        bits_to_clear |=
            IA32_PERF_GLOBAL_STATUS_UNCORE_OVF_MASK | IA32_PERF_GLOBAL_STATUS_COND_CHGD_MASK;

        // Clear everything that was observed set.
        bits_to_clear |= status;

        LTRACEF!("cpu {}: clearing status bits {:#x}", cpu, bits_to_clear);
        hw.write_msr(IA32_PERF_GLOBAL_STATUS_RESET, bits_to_clear);

        let end_status = hw.read_msr(IA32_PERF_GLOBAL_STATUS);
        if end_status != 0 {
            TRACEF!("WARNING: cpu {}: end status {:#x}", cpu, end_status);
        }

        true
    }
}

// ============================================================================
// Tests
// ============================================================================
