//! goscope entry point: introspect the target, attach probes, and stream
//! interpreted scheduler events until interrupted.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use aya::EbpfLoader;
use clap::Parser;
use log::warn;

use goscope::assemble::{EventAssembler, RingBufSource};
use goscope::cli::Args;
use goscope::display;
use goscope::introspect::Introspector;
use goscope::probes::{
    AttachPoint, AyaDescriptorArray, AyaFacility, FunctionProbe, Orchestrator, PackageProbe,
};

/// Scheduler entry points the probe programs hook, besides the per-line
/// delay probes across the instrumented package.
const RUNTIME_PROBES: &[(&str, &str, AttachPoint)] = &[
    ("newproc", "go_newproc", AttachPoint::Entry),
    ("schedule", "go_schedule", AttachPoint::Entry),
    ("execute", "go_execute", AttachPoint::Entry),
    ("gopark", "go_gopark", AttachPoint::Entry),
    ("goready", "go_goready", AttachPoint::Entry),
];

/// Scheduler globals the probe programs dereference in the target.
const PROBE_GLOBALS: &[(&str, &str)] =
    &[("target_sched", "runtime.sched"), ("target_allp", "runtime.allp")];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("🔍 goscope v0.1.0");

    let target = fs::canonicalize(&args.target)
        .with_context(|| format!("resolve target path {}", args.target))?;
    println!("📦 target: {}", target.display());

    let introspector =
        Arc::new(Introspector::open(&target).context("introspect target binary")?);
    let planner = Orchestrator::new(&introspector, ());

    // Probe globals must be in place before the object is verified, so
    // resolve them first and hand them to the loader.
    let probe_bytes =
        fs::read(&args.probes).with_context(|| format!("read {}", args.probes.display()))?;
    let mut loader = EbpfLoader::new();
    let globals = planner.global_addresses(PROBE_GLOBALS)?;
    for (name, address) in &globals {
        loader.set_global(name, address, true);
    }
    let mut ebpf = loader.load(&probe_bytes).context("load probe object")?;

    {
        let mut orchestrator = Orchestrator::new(
            &introspector,
            AyaFacility::new(&mut ebpf, target.clone(), args.pid),
        );
        for (function, program, at) in RUNTIME_PROBES {
            orchestrator.instrument_function(&FunctionProbe {
                package: "runtime".to_string(),
                function: (*function).to_string(),
                at: *at,
                program: (*program).to_string(),
            })?;
        }
        orchestrator.instrument_package(&PackageProbe {
            package: args.package.clone(),
            program: "delay".to_string(),
        })?;
    }

    let mut func_info_map = ebpf.take_map("FUNC_INFO").context("FUNC_INFO map not found")?;
    let mut sink = AyaDescriptorArray::new(&mut func_info_map)?;
    planner.upload_function_table(&mut sink)?;

    let ring = RingBuf::try_from(ebpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let (source, source_handle) = RingBufSource::new(ring);
    let running = EventAssembler::new(introspector, source).start();

    // Print on a plain thread; the channel closing ends it.
    let json = args.json;
    let events = running.events.clone();
    let printer = std::thread::spawn(move || {
        for event in events {
            if json {
                match display::render_json(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!("⚠️  serialize probe event: {err}"),
                }
            } else {
                println!("{}", display::render(&event));
            }
        }
    });

    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n✓ interrupt received, shutting down");
        }
        () = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        } => {
            println!("\n✓ duration limit reached ({}s), shutting down", args.duration);
        }
    }

    source_handle.close();
    running.join();
    printer.join().ok();
    Ok(())
}
