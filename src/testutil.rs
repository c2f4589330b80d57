// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Test doubles for the perfmon core
//!
//! A fake machine with per-CPU MSR files, a heap-backed VMO, and a trace
//! buffer parser. The fake models the one piece of MSR behavior the core
//! depends on: a write to GLOBAL_STATUS_RESET clears the written bits in
//! GLOBAL_STATUS.

use crate::arch::{CpuidLeaf, PerfmonHw};
use crate::msr::{IA32_PERF_CAPABILITIES, IA32_PERF_GLOBAL_STATUS, IA32_PERF_GLOBAL_STATUS_RESET};
use crate::types::{CpuId, Result, ERR_IO};
use crate::vmo::{RefPtr, VmMapping, VmObject};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::vec::Vec;

pub const FAKE_CR3: u64 = 0x1234_5000;
pub const FAKE_TICKS_PER_SECOND: u64 = 1_000_000_000;
pub const FAKE_PERF_CAPABILITIES: u64 = 0x33;

const X86_FEATURE_PDCM: u32 = 1 << 15;

/// ============================================================================
/// Fake machine
/// ============================================================================

pub struct FakeCpu {
    pub msrs: BTreeMap<u32, u64>,
    pub msr_log: Vec<(u32, u64)>,
    pub pmi_masked: bool,
    pub eoi_count: u32,
}

impl FakeCpu {
    fn new() -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(IA32_PERF_CAPABILITIES, FAKE_PERF_CAPABILITIES);
        Self {
            msrs,
            msr_log: Vec::new(),
            // The PMI vector starts out masked, as at boot.
            pmi_masked: true,
            eoi_count: 0,
        }
    }
}

pub struct FakePerfmonHw {
    num_cpus: CpuId,
    cpus: spin::Mutex<Vec<FakeCpu>>,
    cur_cpu: AtomicU32,
    tsc: AtomicU64,
    pmu_leaf: Option<CpuidLeaf>,
}

impl FakePerfmonHw {
    /// cpuid.0AH as a Skylake-ish part reports it: version 4, 4
    /// programmable counters 48 bits wide, 3 fixed counters 48 bits wide.
    pub fn skylake_leaf() -> CpuidLeaf {
        CpuidLeaf {
            a: 4 | (4 << 8) | (48 << 16) | (7 << 24),
            b: 0,
            c: 0,
            d: 3 | (48 << 5),
        }
    }

    pub fn new(num_cpus: CpuId) -> Self {
        Self::with_leaf(num_cpus, Some(Self::skylake_leaf()))
    }

    /// A machine whose CPUID lacks the performance monitoring leaf.
    pub fn unsupported(num_cpus: CpuId) -> Self {
        Self::with_leaf(num_cpus, None)
    }

    pub fn with_leaf(num_cpus: CpuId, pmu_leaf: Option<CpuidLeaf>) -> Self {
        let cpus = (0..num_cpus).map(|_| FakeCpu::new()).collect();
        Self {
            num_cpus,
            cpus: spin::Mutex::new(cpus),
            cur_cpu: AtomicU32::new(0),
            tsc: AtomicU64::new(0),
            pmu_leaf,
        }
    }

    fn cur(&self) -> usize {
        self.cur_cpu.load(Ordering::Relaxed) as usize
    }

    pub fn set_cur_cpu(&self, cpu: CpuId) {
        self.cur_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn msr(&self, cpu: CpuId, msr: u32) -> u64 {
        self.cpus.lock()[cpu as usize].msrs.get(&msr).copied().unwrap_or(0)
    }

    /// Poke an MSR directly, bypassing the write log; simulates the
    /// hardware counting or setting overflow bits on its own.
    pub fn set_msr(&self, cpu: CpuId, msr: u32, value: u64) {
        self.cpus.lock()[cpu as usize].msrs.insert(msr, value);
    }

    pub fn pmi_masked(&self, cpu: CpuId) -> bool {
        self.cpus.lock()[cpu as usize].pmi_masked
    }

    pub fn eoi_count(&self, cpu: CpuId) -> u32 {
        self.cpus.lock()[cpu as usize].eoi_count
    }

    pub fn msr_log(&self, cpu: CpuId) -> Vec<(u32, u64)> {
        self.cpus.lock()[cpu as usize].msr_log.clone()
    }

    pub fn clear_msr_logs(&self) {
        for cpu in self.cpus.lock().iter_mut() {
            cpu.msr_log.clear();
        }
    }
}

impl PerfmonHw for FakePerfmonHw {
    fn max_num_cpus(&self) -> CpuId {
        self.num_cpus
    }

    fn curr_cpu_num(&self) -> CpuId {
        self.cur_cpu.load(Ordering::Relaxed)
    }

    fn cpuid(&self, leaf: u32, _subleaf: u32) -> Option<CpuidLeaf> {
        match leaf {
            0x1 => Some(CpuidLeaf {
                c: X86_FEATURE_PDCM,
                ..CpuidLeaf::default()
            }),
            0xa => self.pmu_leaf,
            _ => None,
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        let cur = self.cur();
        self.cpus.lock()[cur].msrs.get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let cur = self.cur();
        let mut cpus = self.cpus.lock();
        let cpu = &mut cpus[cur];
        cpu.msr_log.push((msr, value));
        if msr == IA32_PERF_GLOBAL_STATUS_RESET {
            let status = cpu.msrs.entry(IA32_PERF_GLOBAL_STATUS).or_insert(0);
            *status &= !value;
        } else {
            cpu.msrs.insert(msr, value);
        }
    }

    fn rdtsc(&self) -> u64 {
        self.tsc.fetch_add(100, Ordering::Relaxed) + 100
    }

    fn read_cr3(&self) -> u64 {
        FAKE_CR3
    }

    fn ticks_per_second(&self) -> u64 {
        FAKE_TICKS_PER_SECOND
    }

    fn sync_exec(&self, task: &(dyn Fn(CpuId) + Sync)) {
        let prev = self.cur_cpu.load(Ordering::Relaxed);
        for cpu in 0..self.num_cpus {
            self.cur_cpu.store(cpu, Ordering::Relaxed);
            task(cpu);
        }
        self.cur_cpu.store(prev, Ordering::Relaxed);
    }

    fn apic_pmi_mask(&self) {
        let cur = self.cur();
        self.cpus.lock()[cur].pmi_masked = true;
    }

    fn apic_pmi_unmask(&self) {
        let cur = self.cur();
        self.cpus.lock()[cur].pmi_masked = false;
    }

    fn apic_issue_eoi(&self) {
        let cur = self.cur();
        self.cpus.lock()[cur].eoi_count += 1;
    }
}

/// ============================================================================
/// Heap-backed VMO
/// ============================================================================

pub struct TestVmo {
    mem: *mut u8,
    layout: Layout,
    size: usize,
    fail_map: AtomicBool,
    pub map_count: AtomicU32,
    pub unmap_count: Arc<AtomicU32>,
}

// The raw allocation is owned for the object's lifetime and only shared
// through mappings the tests serialise.
unsafe impl Send for TestVmo {}
unsafe impl Sync for TestVmo {}

impl TestVmo {
    pub fn new(size: usize) -> RefPtr<TestVmo> {
        // Page-aligned like a real kernel mapping.
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let mem = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!mem.is_null());
        RefPtr::new(Self {
            mem,
            layout,
            size,
            fail_map: AtomicBool::new(false),
            map_count: AtomicU32::new(0),
            unmap_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// A VMO whose mapping attempt fails.
    pub fn failing(size: usize) -> RefPtr<TestVmo> {
        let vmo = Self::new(size);
        vmo.fail_map.store(true, Ordering::Relaxed);
        vmo
    }

    pub fn contents(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.mem, self.size).to_vec() }
    }
}

impl Drop for TestVmo {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.mem, self.layout) };
    }
}

impl VmObject for TestVmo {
    fn size(&self) -> usize {
        self.size
    }

    fn map(&self) -> Result<VmMapping> {
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(ERR_IO);
        }
        self.map_count.fetch_add(1, Ordering::Relaxed);
        let unmaps = self.unmap_count.clone();
        Ok(VmMapping::new(
            NonNull::new(self.mem).unwrap(),
            self.size,
            move || {
                unmaps.fetch_add(1, Ordering::Relaxed);
            },
        ))
    }
}

/// ============================================================================
/// Trace buffer parser
/// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Tick { event: u16, time: u64 },
    Value { event: u16, time: u64, value: u64 },
    Pc { event: u16, time: u64, aspace: u64, pc: u64 },
}

impl Record {
    pub fn time(&self) -> u64 {
        match *self {
            Record::Tick { time, .. } => time,
            Record::Value { time, .. } => time,
            Record::Pc { time, .. } => time,
        }
    }
}

#[derive(Debug)]
pub struct ParsedBuffer {
    pub version: u32,
    pub arch: u32,
    pub flags: u32,
    pub ticks_per_second: u64,
    pub capture_end: u64,
    pub records: Vec<Record>,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Walk a trace buffer the way the userspace driver does.
pub fn parse_buffer(buf: &[u8]) -> ParsedBuffer {
    use crate::cpuperf::{CPUPERF_RECORD_PC, CPUPERF_RECORD_TICK, CPUPERF_RECORD_VALUE};

    let capture_end = read_u64(buf, 24);
    assert!(capture_end as usize <= buf.len());

    let mut records = Vec::new();
    let mut off = 32;
    while (off as u64) < capture_end {
        let record_type = buf[off];
        let event = read_u16(buf, off + 2);
        let time = read_u64(buf, off + 8);
        let record = match record_type {
            CPUPERF_RECORD_TICK => {
                off += 16;
                Record::Tick { event, time }
            }
            CPUPERF_RECORD_VALUE => {
                let value = read_u64(buf, off + 16);
                off += 24;
                Record::Value { event, time, value }
            }
            CPUPERF_RECORD_PC => {
                let aspace = read_u64(buf, off + 16);
                let pc = read_u64(buf, off + 24);
                off += 32;
                Record::Pc {
                    event,
                    time,
                    aspace,
                    pc,
                }
            }
            other => panic!("unknown record type {} at offset {}", other, off),
        };
        records.push(record);
    }
    assert_eq!(off as u64, capture_end);

    ParsedBuffer {
        version: read_u32(buf, 0),
        arch: read_u32(buf, 4),
        flags: read_u32(buf, 8),
        ticks_per_second: read_u64(buf, 16),
        capture_end,
        records,
    }
}
