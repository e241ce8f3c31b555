//! Typed records: the unit the codec produces and consumes, and the unit the
//! connection state machines dispatch on.

use bytes::Bytes;

use crate::protocol::{ProtocolStatus, RecordType, Role, KEEP_CONN};

/// One FastCGI record, already stripped of framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 0 for connection-management records, 1..=65535 for request records.
    pub request_id: u16,
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    EndRequest(EndRequest),
    /// An empty pair list is the end-of-params sentinel.
    Params(Vec<(String, String)>),
    /// For the four stream bodies an empty payload means end-of-stream.
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Vec<String>),
    GetValuesResult(Vec<(String, String)>),
    /// Reply naming a record type code the peer did not recognize.
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequest {
    pub fn keep_conn(&self) -> bool {
        self.flags & KEEP_CONN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self.body {
            RecordBody::BeginRequest(_) => RecordType::BeginRequest,
            RecordBody::AbortRequest => RecordType::AbortRequest,
            RecordBody::EndRequest(_) => RecordType::EndRequest,
            RecordBody::Params(_) => RecordType::Params,
            RecordBody::Stdin(_) => RecordType::Stdin,
            RecordBody::Stdout(_) => RecordType::Stdout,
            RecordBody::Stderr(_) => RecordType::Stderr,
            RecordBody::Data(_) => RecordType::Data,
            RecordBody::GetValues(_) => RecordType::GetValues,
            RecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            RecordBody::UnknownType(_) => RecordType::UnknownType,
        }
    }

    pub fn begin_request(request_id: u16, role: Role, flags: u8) -> Record {
        Record {
            request_id,
            body: RecordBody::BeginRequest(BeginRequest { role, flags }),
        }
    }

    pub fn abort_request(request_id: u16) -> Record {
        Record {
            request_id,
            body: RecordBody::AbortRequest,
        }
    }

    pub fn end_request(request_id: u16, app_status: u32, protocol_status: ProtocolStatus) -> Record {
        Record {
            request_id,
            body: RecordBody::EndRequest(EndRequest {
                app_status,
                protocol_status,
            }),
        }
    }

    pub fn params(request_id: u16, params: Vec<(String, String)>) -> Record {
        Record {
            request_id,
            body: RecordBody::Params(params),
        }
    }

    /// The end-of-params sentinel.
    pub fn params_done(request_id: u16) -> Record {
        Record::params(request_id, Vec::new())
    }

    pub fn stream(request_id: u16, record_type: RecordType, data: Bytes) -> Record {
        let body = match record_type {
            RecordType::Stdin => RecordBody::Stdin(data),
            RecordType::Stdout => RecordBody::Stdout(data),
            RecordType::Stderr => RecordBody::Stderr(data),
            RecordType::Data => RecordBody::Data(data),
            other => panic!("{:?} is not a stream record type", other),
        };
        Record { request_id, body }
    }

    pub fn stdin(request_id: u16, data: impl Into<Bytes>) -> Record {
        Record::stream(request_id, RecordType::Stdin, data.into())
    }

    pub fn stdout(request_id: u16, data: impl Into<Bytes>) -> Record {
        Record::stream(request_id, RecordType::Stdout, data.into())
    }

    pub fn stderr(request_id: u16, data: impl Into<Bytes>) -> Record {
        Record::stream(request_id, RecordType::Stderr, data.into())
    }

    pub fn data(request_id: u16, data: impl Into<Bytes>) -> Record {
        Record::stream(request_id, RecordType::Data, data.into())
    }

    pub fn get_values(keys: Vec<String>) -> Record {
        Record {
            request_id: 0,
            body: RecordBody::GetValues(keys),
        }
    }

    pub fn get_values_result(values: Vec<(String, String)>) -> Record {
        Record {
            request_id: 0,
            body: RecordBody::GetValuesResult(values),
        }
    }
}
