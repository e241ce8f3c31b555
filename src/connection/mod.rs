//! Connection state machines: one task per transport connection, owning the
//! framed codec and the per-request-id bookkeeping. Request handles talk
//! back to their connection over a bounded control channel, so transport
//! backpressure reaches every writer.

use bytes::Bytes;

use crate::protocol::{ProtocolStatus, RecordType};

pub mod incoming;
pub mod outgoing;

/// Messages from request handles into their owning connection task.
#[derive(Debug)]
pub(crate) enum Control {
    /// Frame `data` as a stream record. Empty data is the end-of-stream
    /// record.
    Write {
        id: u16,
        record_type: RecordType,
        data: Bytes,
    },
    /// Finish an incoming request: close its output streams and send
    /// END_REQUEST.
    End {
        id: u16,
        app_status: u32,
        protocol_status: ProtocolStatus,
    },
    /// Abort an outgoing request: send ABORT_REQUEST and drop bookkeeping.
    Abort { id: u16 },
}

/// Requests queued for the application before it accepts them.
pub(crate) const REQUEST_CAPACITY: usize = 16;

/// In-flight control messages per connection; writers block (and so see the
/// transport's backpressure) once this fills.
pub(crate) const CONTROL_CAPACITY: usize = 32;

/// Buffered payload chunks per input stream; the connection's read loop
/// blocks once a slow consumer falls this far behind.
pub(crate) const INPUT_CAPACITY: usize = 32;
