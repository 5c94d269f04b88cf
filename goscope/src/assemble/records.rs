//! Raw record decoding.
//!
//! Records arrive from the ring buffer as contiguous host-byte-order
//! fields laid out per `goscope-common`. Decoding is field-by-field
//! against an explicit byte order; a record too short for its declared
//! type is a fatal decode error, never a partial value.

use goscope_common::{
    DelayRecord, ExecuteRecord, GlobalRunqStatusRecord, NewTaskRecord, ParkRecord,
    RawQueueEntry, ReadyRecord, RunqStatusRecord, ScheduleRecord, MAX_CALLSTACK_DEPTH,
    WAIT_REASON_LEN,
};

use crate::byteorder::ByteOrder;
use crate::domain::AssembleError;

pub struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
    event_type: u64,
}

impl<'a> RecordCursor<'a> {
    /// Read the leading discriminant and position the cursor after it.
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Result<Self, AssembleError> {
        let mut cursor = Self { buf, pos: 0, order, event_type: 0 };
        cursor.event_type = cursor.u64()?;
        Ok(cursor)
    }

    pub fn event_type(&self) -> u64 {
        self.event_type
    }

    fn truncated(&self) -> AssembleError {
        AssembleError::Truncated { event_type: self.event_type, len: self.buf.len() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AssembleError> {
        let bytes = self.buf.get(self.pos..self.pos + n).ok_or_else(|| self.truncated())?;
        self.pos += n;
        Ok(bytes)
    }

    fn u64(&mut self) -> Result<u64, AssembleError> {
        let bytes = self.take(8)?;
        Ok(self.order.u64(bytes.try_into().expect("eight bytes")))
    }

    fn i64(&mut self) -> Result<i64, AssembleError> {
        Ok(self.u64()? as i64)
    }

    fn entry(&mut self) -> Result<RawQueueEntry, AssembleError> {
        Ok(RawQueueEntry { pc: self.u64()?, task_id: self.u64()? })
    }
}

/// Decoding of one record type from a positioned cursor.
pub trait ParseRecord: Sized {
    fn parse(cursor: &mut RecordCursor<'_>) -> Result<Self, AssembleError>;
}

impl ParseRecord for NewTaskRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self {
            event_type: c.event_type(),
            pc: c.u64()?,
            creator_task_id: c.u64()?,
            worker_id: c.i64()?,
        })
    }
}

impl ParseRecord for DelayRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self {
            event_type: c.event_type(),
            pc: c.u64()?,
            task_id: c.u64()?,
            worker_id: c.i64()?,
        })
    }
}

impl ParseRecord for RunqStatusRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self {
            event_type: c.event_type(),
            proc_id: c.i64()?,
            head: c.u64()?,
            tail: c.u64()?,
            entry_index: c.u64()?,
            entry: c.entry()?,
            worker_id: c.i64()?,
            grouping_worker_id: c.i64()?,
        })
    }
}

impl ParseRecord for GlobalRunqStatusRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self {
            event_type: c.event_type(),
            size: c.i64()?,
            entry_index: c.u64()?,
            entry: c.entry()?,
        })
    }
}

impl ParseRecord for ScheduleRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        let event_type = c.event_type();
        let worker_id = c.i64()?;
        let mut callstack = [0u64; MAX_CALLSTACK_DEPTH];
        for frame in &mut callstack {
            *frame = c.u64()?;
        }
        Ok(Self { event_type, worker_id, callstack, depth: c.i64()?, proc_id: c.i64()? })
    }
}

impl ParseRecord for ParkRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        let event_type = c.event_type();
        let worker_id = c.i64()?;
        let parked = c.entry()?;
        let mut wait_reason = [0u8; WAIT_REASON_LEN];
        wait_reason.copy_from_slice(c.take(WAIT_REASON_LEN)?);
        Ok(Self { event_type, worker_id, parked, wait_reason })
    }
}

impl ParseRecord for ReadyRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self { event_type: c.event_type(), worker_id: c.i64()?, task_id: c.u64()? })
    }
}

impl ParseRecord for ExecuteRecord {
    fn parse(c: &mut RecordCursor<'_>) -> Result<Self, AssembleError> {
        Ok(Self {
            event_type: c.event_type(),
            worker_id: c.i64()?,
            found: c.entry()?,
            caller_pc: c.u64()?,
            proc_id: c.i64()?,
            num_processors: c.u64()?,
        })
    }
}
