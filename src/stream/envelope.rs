//! Dropsonde envelope messages carried on the stream.
//!
//! Each binary websocket message holds exactly one protobuf-encoded
//! [`Envelope`]. Field tags follow the dropsonde `events` protocol.

use std::collections::HashMap;

use prost::Message;

/// Kind of payload carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    HttpStartStop = 4,
    LogMessage = 5,
    ValueMetric = 6,
    CounterEvent = 7,
    Error = 8,
    ContainerMetric = 9,
}

/// Output stream a log line was written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Out = 1,
    Err = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PeerType {
    Client = 1,
    Server = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Head = 5,
    Acl = 6,
    Baseline = 7,
    Bind = 8,
    Checkin = 9,
    Checkout = 10,
    Connect = 11,
    Copy = 12,
    Debug = 13,
    Label = 14,
    Link = 15,
    Lock = 16,
    Merge = 17,
    Mkactivity = 18,
    Mkcalendar = 19,
    Mkcol = 20,
    Mkredirectref = 21,
    Mkworkspace = 22,
    Move = 23,
    Options = 24,
    Orderpatch = 25,
    Patch = 26,
    Pri = 27,
    Propfind = 28,
    Proppatch = 29,
    Rebind = 30,
    Report = 31,
    Search = 32,
    Showmethod = 33,
    Spacejump = 34,
    Textsearch = 35,
    Trace = 36,
    Track = 37,
    Unbind = 38,
    Uncheckout = 39,
    Unlink = 40,
    Unlock = 41,
    Update = 42,
    Updateredirectref = 43,
    VersionControl = 44,
}

/// Top-level unit of telemetry read off the stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Component that emitted the event.
    #[prost(string, required, tag = "1")]
    pub origin: String,
    #[prost(enumeration = "EventType", required, tag = "2")]
    pub event_type: i32,
    /// Nanoseconds since the Unix epoch.
    #[prost(int64, optional, tag = "6")]
    pub timestamp: Option<i64>,
    #[prost(string, optional, tag = "13")]
    pub deployment: Option<String>,
    #[prost(string, optional, tag = "14")]
    pub job: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub index: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub ip: Option<String>,
    #[prost(map = "string, string", tag = "17")]
    pub tags: HashMap<String, String>,
    #[prost(message, optional, tag = "7")]
    pub http_start_stop: Option<HttpStartStop>,
    #[prost(message, optional, tag = "8")]
    pub log_message: Option<LogMessage>,
    #[prost(message, optional, tag = "9")]
    pub value_metric: Option<ValueMetric>,
    #[prost(message, optional, tag = "10")]
    pub counter_event: Option<CounterEvent>,
    #[prost(message, optional, tag = "11")]
    pub error: Option<Error>,
    #[prost(message, optional, tag = "12")]
    pub container_metric: Option<ContainerMetric>,
}

impl Envelope {
    /// Decodes one envelope from a binary frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(frame)
    }

    /// Encodes the envelope into a binary frame.
    pub fn to_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Returns the log payload when this is a log-message envelope.
    pub fn into_log_message(self) -> Option<LogMessage> {
        if matches!(EventType::try_from(self.event_type), Ok(EventType::LogMessage)) {
            self.log_message
        } else {
            None
        }
    }
}

/// One line of application or platform log output.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogMessage {
    #[prost(bytes = "vec", required, tag = "1")]
    pub message: Vec<u8>,
    #[prost(enumeration = "MessageType", required, tag = "2")]
    pub message_type: i32,
    /// Nanoseconds since the Unix epoch.
    #[prost(int64, required, tag = "3")]
    pub timestamp: i64,
    #[prost(string, optional, tag = "4")]
    pub app_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub source_type: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub source_instance: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ValueMetric {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(double, required, tag = "2")]
    pub value: f64,
    #[prost(string, required, tag = "3")]
    pub unit: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CounterEvent {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(uint64, required, tag = "2")]
    pub delta: u64,
    #[prost(uint64, optional, tag = "3")]
    pub total: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerMetric {
    #[prost(string, required, tag = "1")]
    pub application_id: String,
    #[prost(int32, required, tag = "2")]
    pub instance_index: i32,
    #[prost(double, required, tag = "3")]
    pub cpu_percentage: f64,
    #[prost(uint64, required, tag = "4")]
    pub memory_bytes: u64,
    #[prost(uint64, required, tag = "5")]
    pub disk_bytes: u64,
    #[prost(uint64, optional, tag = "6")]
    pub memory_bytes_quota: Option<u64>,
    #[prost(uint64, optional, tag = "7")]
    pub disk_bytes_quota: Option<u64>,
}

/// Error reported by a platform component.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(string, required, tag = "1")]
    pub source: String,
    #[prost(int32, required, tag = "2")]
    pub code: i32,
    #[prost(string, required, tag = "3")]
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Uuid {
    #[prost(uint64, required, tag = "1")]
    pub low: u64,
    #[prost(uint64, required, tag = "2")]
    pub high: u64,
}

/// Lifecycle of one HTTP request through the router.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HttpStartStop {
    #[prost(int64, required, tag = "1")]
    pub start_timestamp: i64,
    #[prost(int64, required, tag = "2")]
    pub stop_timestamp: i64,
    #[prost(message, optional, tag = "3")]
    pub request_id: Option<Uuid>,
    #[prost(enumeration = "PeerType", required, tag = "4")]
    pub peer_type: i32,
    #[prost(enumeration = "Method", required, tag = "5")]
    pub method: i32,
    #[prost(string, required, tag = "6")]
    pub uri: String,
    #[prost(string, required, tag = "7")]
    pub remote_address: String,
    #[prost(string, required, tag = "8")]
    pub user_agent: String,
    #[prost(int32, required, tag = "9")]
    pub status_code: i32,
    #[prost(int64, required, tag = "10")]
    pub content_length: i64,
    #[prost(message, optional, tag = "12")]
    pub application_id: Option<Uuid>,
    #[prost(int32, optional, tag = "13")]
    pub instance_index: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub instance_id: Option<String>,
    #[prost(string, repeated, tag = "15")]
    pub forwarded: Vec<String>,
}
