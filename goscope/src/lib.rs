//! # goscope - scheduler-level observability for Go binaries
//!
//! goscope extracts scheduler events from a running Go program through
//! eBPF uprobes and turns them into source-annotated probe events for a
//! visualization client: task creation, park/ready transitions, schedule
//! decisions, and streamed run-queue snapshots.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                  Observed Go Program                       │
//! │        (M:N scheduler: tasks on workers on procs)          │
//! └──────────────────────────┬─────────────────────────────────┘
//!                            │ uprobes at introspected offsets
//!                            ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                eBPF Probe Programs (kernel)                │
//! │   fixed-layout raw records into a lossy ring buffer        │
//! └──────────────────────────┬─────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                   goscope (this crate)                     │
//! │                                                            │
//! │  ┌─────────────┐    offsets,     ┌──────────────────┐    │
//! │  │ Introspect  │───descriptors──▶│      Probes      │    │
//! │  │ (ELF, line  │                 │  (orchestration) │    │
//! │  │  table, x86)│                 └──────────────────┘    │
//! │  └──────┬──────┘                                          │
//! │         │ PC -> (file, line, func)                        │
//! │         ▼                                                 │
//! │  ┌─────────────┐   canonical    ┌──────────────────┐     │
//! │  │  Assemble   │────events─────▶│     Display      │     │
//! │  │ (intake +   │    channel     │ (text / JSON)    │     │
//! │  │  decode)    │                └──────────────────┘     │
//! │  └─────────────┘                                          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`introspect`]: parse the target binary once, read-only thereafter.
//!   ELF sections and symbols, the embedded line table, an x86-64
//!   instruction scanner for prologue/return offsets, and the function
//!   descriptor table.
//! - [`assemble`]: the event assembler. An intake thread drains the ring
//!   buffer; a decode thread demultiplexes raw records, assembles
//!   multi-record snapshots, and emits [`assemble::ProbeEvent`]s.
//! - [`probes`]: translate instrumentation requests into uprobe
//!   attachments and stage kernel-side tables.
//! - [`display`]: render events for headless output.
//! - [`domain`]: shared error types.
//!
//! The raw record layouts live in the `goscope-common` crate, shared with
//! the (separately built) probe programs.

pub mod assemble;
pub mod byteorder;
pub mod cli;
pub mod display;
pub mod domain;
pub mod introspect;
pub mod probes;
