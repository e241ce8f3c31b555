//! Protocol-level constants and enums: the fixed numbers of the FastCGI wire
//! format, plus the capability set exchanged through GET_VALUES.

use num_derive::FromPrimitive;

pub const FASTCGI_VERSION: u8 = 1;

/// Fixed record header size.
pub const HEADER_LEN: usize = 8;

/// Largest content region a single record can carry.
pub const MAX_CONTENT_LEN: usize = 0xffff;

/// Request id 0 is reserved for connection-management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// BEGIN_REQUEST flag bit: keep the transport open after the request ends.
pub const KEEP_CONN: u8 = 1;

/// Default encoder alignment: header+content+padding fills multiples of 8.
pub const DEFAULT_PADDING_FIT: u8 = 8;

// Variable names for the GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Stream record types carry raw payload bytes and may be split across
    /// any number of frames; an empty frame marks end-of-stream.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            RecordType::Stdin | RecordType::Stdout | RecordType::Stderr | RecordType::Data
        )
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplexConnections = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// The capability set negotiated through GET_VALUES / GET_VALUES_RESULT.
///
/// A server answers queries from its configured set; a client caches the
/// parsed reply. Unset fields are omitted from replies and stay `None` after
/// a parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    pub max_conns: Option<u32>,
    pub max_reqs: Option<u32>,
    pub mpxs_conns: Option<bool>,
}

impl Config {
    /// Answer a GET_VALUES query: the intersection of the requested keys and
    /// the set fields. Numbers serialize as decimal, booleans as "0"/"1".
    pub fn matching_values<S: AsRef<str>>(&self, keys: &[S]) -> Vec<(String, String)> {
        let mut values = Vec::new();
        for key in keys {
            let value = match key.as_ref() {
                FCGI_MAX_CONNS => self.max_conns.map(|n| n.to_string()),
                FCGI_MAX_REQS => self.max_reqs.map(|n| n.to_string()),
                FCGI_MPXS_CONNS => self.mpxs_conns.map(|b| String::from(if b { "1" } else { "0" })),
                _ => None,
            };
            if let Some(value) = value {
                values.push((key.as_ref().to_owned(), value));
            }
        }
        values
    }

    /// Parse a GET_VALUES_RESULT value list. Unparsable numbers are treated
    /// as unset; the multiplexing flag is true exactly for "1".
    pub fn from_values(values: &[(String, String)]) -> Config {
        let mut config = Config::default();
        for (key, value) in values {
            match key.as_str() {
                FCGI_MAX_CONNS => config.max_conns = value.parse().ok(),
                FCGI_MAX_REQS => config.max_reqs = value.parse().ok(),
                FCGI_MPXS_CONNS => config.mpxs_conns = Some(value == "1"),
                _ => {}
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn record_type_codes() {
        assert_eq!(RecordType::from_u8(1), Some(RecordType::BeginRequest));
        assert_eq!(RecordType::from_u8(11), Some(RecordType::UnknownType));
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(12), None);
        assert!(RecordType::Stdin.is_stream());
        assert!(RecordType::Data.is_stream());
        assert!(!RecordType::Params.is_stream());
    }

    #[test]
    fn role_and_status_codes() {
        assert_eq!(Role::from_u16(3), Some(Role::Filter));
        assert_eq!(Role::from_u16(4), None);
        assert_eq!(
            ProtocolStatus::from_u8(1),
            Some(ProtocolStatus::CantMultiplexConnections)
        );
        assert_eq!(ProtocolStatus::from_u8(4), None);
    }

    #[test]
    fn matching_values_intersects_with_set_keys() {
        let config = Config {
            max_conns: Some(10),
            ..Config::default()
        };
        let values = config.matching_values(&[FCGI_MAX_CONNS, FCGI_MPXS_CONNS]);
        assert_eq!(values, vec![(FCGI_MAX_CONNS.to_owned(), "10".to_owned())]);
    }

    #[test]
    fn matching_values_serializes_booleans() {
        let config = Config {
            mpxs_conns: Some(true),
            ..Config::default()
        };
        let values = config.matching_values(&[FCGI_MPXS_CONNS]);
        assert_eq!(values, vec![(FCGI_MPXS_CONNS.to_owned(), "1".to_owned())]);
    }

    #[test]
    fn from_values_round_trips() {
        let values = vec![
            (FCGI_MAX_CONNS.to_owned(), "8".to_owned()),
            (FCGI_MAX_REQS.to_owned(), "16".to_owned()),
            (FCGI_MPXS_CONNS.to_owned(), "1".to_owned()),
        ];
        let config = Config::from_values(&values);
        assert_eq!(config.max_conns, Some(8));
        assert_eq!(config.max_reqs, Some(16));
        assert_eq!(config.mpxs_conns, Some(true));

        let absent = Config::from_values(&[]);
        assert_eq!(absent, Config::default());
    }
}
