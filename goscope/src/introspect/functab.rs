//! Function descriptor extraction.
//!
//! Walks the per-function info records behind the line table's function
//! index and produces the compact descriptors the kernel-side programs
//! need to unwind stacks and identify tasks: entry PC, a reference into
//! the stack-delta table, and the function flag byte.
//!
//! The field offsets are fixed by the 1.20-1.22 info-record layout; the
//! line-table parser already rejects binaries outside that range.

use goscope_common::FunctionDescriptor;

use crate::byteorder::{self, ByteOrder};
use crate::domain::IntrospectError;
use crate::introspect::linetable::LineTable;

const FIELD_OFFSET_PCSP: usize = 16;
const FIELD_OFFSET_FLAG: usize = 41;

/// One descriptor per function, in compiler emission order.
pub fn function_descriptor_table(
    table: &LineTable,
) -> Result<Vec<FunctionDescriptor>, IntrospectError> {
    let order = byteorder::host();
    let mut descriptors = Vec::with_capacity(table.func_count() as usize);
    for idx in 0..table.func_count() {
        let info = table.func_info_bytes(idx)?;
        let entry_off = field_u32(info, 0, order)?;
        let pcsp = field_u32(info, FIELD_OFFSET_PCSP, order)?;
        let flag = *info
            .get(FIELD_OFFSET_FLAG)
            .ok_or(IntrospectError::BadLineTable("function info record truncated"))?;
        descriptors.push(FunctionDescriptor::new(
            table.text_start() + u64::from(entry_off),
            pcsp,
            flag,
        ));
    }
    Ok(descriptors)
}

fn field_u32(info: &[u8], off: usize, order: ByteOrder) -> Result<u32, IntrospectError> {
    let bytes = info
        .get(off..off + 4)
        .ok_or(IntrospectError::BadLineTable("function info record truncated"))?;
    Ok(order.u32(bytes.try_into().expect("four field bytes")))
}
