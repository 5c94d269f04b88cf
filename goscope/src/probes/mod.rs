//! Probe orchestration: from high-level instrumentation requests to
//! attached kernel probes.
//!
//! The orchestrator owns no kernel state itself. It asks the
//! [`Introspector`] for byte offsets, then drives a [`ProbeFacility`]
//! (the thin adapter over whatever attaches probe programs) and a
//! [`DescriptorSink`] that receives the function descriptor table. The
//! aya-backed implementations of both live here; tests substitute
//! recording fakes.

use aya::maps::{Array, Map, MapData};
use aya::programs::UProbe;
use aya::Ebpf;
use goscope_common::FunctionDescriptor;
use log::{debug, info};

use std::collections::HashSet;
use std::path::PathBuf;

use crate::domain::ProbeError;
use crate::introspect::Introspector;

/// Where in a function a probe lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPoint {
    /// The first instruction after the stack-growth prologue.
    Entry,
    /// Every return instruction.
    Returns,
}

/// Attach one probe program to one function of the target.
#[derive(Debug, Clone)]
pub struct FunctionProbe {
    pub package: String,
    pub function: String,
    pub at: AttachPoint,
    pub program: String,
}

/// Attach one probe program to every instrumentable offset of a package.
#[derive(Debug, Clone)]
pub struct PackageProbe {
    pub package: String,
    pub program: String,
}

/// The kernel-probe facility seam: attach `program` at `symbol` +
/// `offset` in the target executable.
pub trait ProbeFacility {
    fn attach(&mut self, program: &str, symbol: &str, offset: u64) -> Result<(), ProbeError>;
}

/// Receives the function descriptor table, one indexed entry at a time.
pub trait DescriptorSink {
    fn put(&mut self, index: u32, descriptor: FunctionDescriptor) -> Result<(), ProbeError>;
}

pub struct Orchestrator<'a, F> {
    introspector: &'a Introspector,
    facility: F,
}

impl<'a, F> Orchestrator<'a, F> {
    pub fn new(introspector: &'a Introspector, facility: F) -> Self {
        Self { introspector, facility }
    }

    /// Stage the descriptor table into the kernel-side array, in
    /// enumeration order. Returns the number of entries written.
    pub fn upload_function_table(
        &self,
        sink: &mut dyn DescriptorSink,
    ) -> Result<usize, ProbeError> {
        let table = self.introspector.function_descriptor_table()?;
        for (index, descriptor) in table.iter().enumerate() {
            sink.put(index as u32, *descriptor)?;
        }
        info!("✓ staged {} function descriptors", table.len());
        Ok(table.len())
    }

    /// Resolve (probe-side variable, target symbol) pairs into the
    /// addresses a loader injects before the probe object is verified.
    pub fn global_addresses(
        &self,
        vars: &[(&str, &str)],
    ) -> Result<Vec<(String, u64)>, ProbeError> {
        vars.iter()
            .map(|&(var, symbol)| {
                let address = self.introspector.address_of_global(symbol)?;
                debug!("probe global {var} <- {symbol} @ {address:#x}");
                Ok((var.to_string(), address))
            })
            .collect()
    }
}

impl<'a, F: ProbeFacility> Orchestrator<'a, F> {
    pub fn instrument_function(&mut self, probe: &FunctionProbe) -> Result<(), ProbeError> {
        let symbol = format!("{}.{}", probe.package, probe.function);
        match probe.at {
            AttachPoint::Entry => {
                let offset = self.introspector.function_start_offset(&symbol)?;
                self.facility.attach(&probe.program, &symbol, offset)?;
                info!("✓ attached {} at entry of {symbol}+{offset:#x}", probe.program);
            }
            AttachPoint::Returns => {
                let offsets = self.introspector.function_return_offsets(&symbol)?;
                debug!("return offsets of {symbol}: {offsets:x?}");
                for offset in &offsets {
                    self.facility.attach(&probe.program, &symbol, *offset)?;
                }
                info!("✓ attached {} at {} returns of {symbol}", probe.program, offsets.len());
            }
        }
        Ok(())
    }

    pub fn instrument_package(&mut self, probe: &PackageProbe) -> Result<(), ProbeError> {
        let offsets = self.introspector.instrumentable_offsets_in_package(&probe.package)?;
        debug!("instrumentable offsets of {}: {offsets:x?}", probe.package);
        let mut count = 0;
        for (symbol, offsets) in &offsets {
            for offset in offsets {
                self.facility.attach(&probe.program, symbol, *offset)?;
                count += 1;
            }
        }
        info!(
            "✓ attached {} at {count} offsets across {} functions of {}",
            probe.program,
            offsets.len(),
            probe.package
        );
        Ok(())
    }
}

/// Uprobe attachment against a loaded eBPF object, the way the kernel
/// facility actually exposes it: (executable, symbol, offset, program).
pub struct AyaFacility<'a> {
    ebpf: &'a mut Ebpf,
    target: PathBuf,
    pid: Option<i32>,
    loaded: HashSet<String>,
}

impl<'a> AyaFacility<'a> {
    pub fn new(ebpf: &'a mut Ebpf, target: PathBuf, pid: Option<i32>) -> Self {
        Self { ebpf, target, pid, loaded: HashSet::new() }
    }
}

impl ProbeFacility for AyaFacility<'_> {
    fn attach(&mut self, program: &str, symbol: &str, offset: u64) -> Result<(), ProbeError> {
        let uprobe: &mut UProbe = self
            .ebpf
            .program_mut(program)
            .ok_or_else(|| ProbeError::ProgramNotFound(program.to_string()))?
            .try_into()
            .map_err(|_| ProbeError::NotAUprobe { program: program.to_string() })?;
        if !self.loaded.contains(program) {
            uprobe
                .load()
                .map_err(|source| ProbeError::Load { program: program.to_string(), source })?;
            self.loaded.insert(program.to_string());
        }
        uprobe.attach(Some(symbol), offset, &self.target, self.pid).map_err(|source| {
            ProbeError::Attach {
                program: program.to_string(),
                symbol: symbol.to_string(),
                offset,
                source,
            }
        })?;
        Ok(())
    }
}

/// Descriptor upload into a pre-sized eBPF array map.
pub struct AyaDescriptorArray<'a> {
    array: Array<&'a mut MapData, FunctionDescriptor>,
}

impl<'a> AyaDescriptorArray<'a> {
    pub fn new(map: &'a mut Map) -> Result<Self, ProbeError> {
        Ok(Self { array: Array::try_from(map)? })
    }
}

impl DescriptorSink for AyaDescriptorArray<'_> {
    fn put(&mut self, index: u32, descriptor: FunctionDescriptor) -> Result<(), ProbeError> {
        self.array.set(index, descriptor, 0)?;
        Ok(())
    }
}
