//! NatNet protocol parsing (OptiTrack Motive streaming)
//!
//! Motive streams over two UDP channels:
//! - Command port 1510 - requests from the client, responses from the server
//! - Data port 1511 - frame data, multicast on 239.255.42.99 by default
//!
//! In unicast mode the server replies to the client's command socket, frame
//! data included, so both channels must be able to dispatch FRAMEOFDATA.
//!
//! Every message starts with a 4 byte header: message id (u16 LE) followed by
//! payload length (u16 LE). All multi-byte fields are little endian.

use std::fmt;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{c_string, read_cstr};
use crate::error::{ListenerError, ParseError};

// =============================================================================
// Network Constants
// =============================================================================

/// Default multicast group Motive streams frame data to
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
/// Command channel port (on the server)
pub const DEFAULT_COMMAND_PORT: u16 = 1510;
/// Data channel port
pub const DEFAULT_DATA_PORT: u16 = 1511;

/// Largest datagram the receive loops accept
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// NatNet version announced in the CONNECT request
pub const CLIENT_NATNET_VERSION: [u8; 4] = [4, 1, 0, 0];

// =============================================================================
// Size Tables
// =============================================================================

/// Message header: id + payload length
pub const HEADER_SIZE: usize = 4;
/// Unlabeled marker: x, y, z as f32
pub const MARKER_SIZE: usize = 12;
/// Rigid body: id, position, quaternion, mean error, tracking flags
pub const RIGID_BODY_SIZE: usize = 38;
/// Server info: 256 byte name + server version + stream version
pub const SERVER_INFO_SIZE: usize = SERVER_NAME_LEN + 8;

const SERVER_NAME_LEN: usize = 256;
const CONNECT_PADDING: usize = 260;
/// "Ping", padding, client version, terminator
const CONNECT_PAYLOAD_SIZE: usize = 4 + CONNECT_PADDING + CLIENT_NATNET_VERSION.len() + 1;

const _: () = assert!(CONNECT_PAYLOAD_SIZE <= u16::MAX as usize);
const _: () = assert!(SERVER_INFO_SIZE <= u16::MAX as usize);

// =============================================================================
// Message Ids
// =============================================================================

/// NatNet message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Connect,
    ServerInfo,
    Request,
    Response,
    RequestModelDef,
    ModelDef,
    RequestFrameOfData,
    FrameOfData,
    MessageString,
    Disconnect,
    KeepAlive,
    UnrecognizedRequest,
    Unknown(u16),
}

impl MessageId {
    pub fn from_value(v: u16) -> Self {
        match v {
            0 => MessageId::Connect,
            1 => MessageId::ServerInfo,
            2 => MessageId::Request,
            3 => MessageId::Response,
            4 => MessageId::RequestModelDef,
            5 => MessageId::ModelDef,
            6 => MessageId::RequestFrameOfData,
            7 => MessageId::FrameOfData,
            8 => MessageId::MessageString,
            9 => MessageId::Disconnect,
            10 => MessageId::KeepAlive,
            100 => MessageId::UnrecognizedRequest,
            _ => MessageId::Unknown(v),
        }
    }

    pub fn value(self) -> u16 {
        match self {
            MessageId::Connect => 0,
            MessageId::ServerInfo => 1,
            MessageId::Request => 2,
            MessageId::Response => 3,
            MessageId::RequestModelDef => 4,
            MessageId::ModelDef => 5,
            MessageId::RequestFrameOfData => 6,
            MessageId::FrameOfData => 7,
            MessageId::MessageString => 8,
            MessageId::Disconnect => 9,
            MessageId::KeepAlive => 10,
            MessageId::UnrecognizedRequest => 100,
            MessageId::Unknown(v) => v,
        }
    }

    /// Requests that carry no payload besides the terminating NUL
    fn has_empty_payload(self) -> bool {
        matches!(
            self,
            MessageId::RequestModelDef | MessageId::RequestFrameOfData | MessageId::KeepAlive
        )
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Unknown(v) => write!(f, "UNKNOWN({})", v),
            other => write!(f, "{:?}({})", other, other.value()),
        }
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    /// Payload length as declared by the sender
    pub length: usize,
}

// =============================================================================
// Wire Records
// =============================================================================

/// Unlabeled marker as laid out on the wire
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
struct MarkerRecord {
    x: f32,
    y: f32,
    z: f32,
}

/// Rigid body as laid out on the wire
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
struct RigidBodyRecord {
    id: i32,
    position: [f32; 3],
    orientation: [f32; 4],
    mean_error: f32,
    tracking: i16,
}

bitflags! {
    /// Rigid body tracking flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TrackingFlags: i16 {
        /// The body was tracked in this frame
        const TRACKING_VALID = 0x01;
    }
}

// =============================================================================
// Decoded Types
// =============================================================================

/// One unlabeled marker in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawMarkerSample {
    pub frame_number: i64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// All markers of one marker set in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerBatch {
    pub frame_number: i64,
    pub set_label: String,
    pub samples: Vec<RawMarkerSample>,
}

/// One rigid body in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub frame_number: i64,
    pub id: i32,
    pub position: [f32; 3],
    /// Quaternion components in wire order
    pub orientation: [f32; 4],
    pub mean_error: f32,
    pub flags: TrackingFlags,
}

impl RigidBody {
    pub fn tracking_valid(&self) -> bool {
        self.flags.contains(TrackingFlags::TRACKING_VALID)
    }
}

/// Fully decoded FRAMEOFDATA payload
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOfData {
    pub frame_number: i64,
    pub marker_sets: Vec<MarkerBatch>,
    pub rigid_bodies: Vec<RigidBody>,
    /// Payload bytes the decoder walked over
    pub bytes_consumed: usize,
}

/// Result of dispatching a FRAMEOFDATA payload to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    pub frame_number: i64,
    pub marker_sets: usize,
    pub rigid_bodies: usize,
    pub bytes_consumed: usize,
    /// Failures reported by listeners, in delivery order
    pub listener_errors: Vec<ListenerError>,
}

/// SERVERINFO payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub application_name: String,
    pub server_version: [u8; 4],
    pub stream_version: [u8; 4],
}

/// RESPONSE payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Numeric command result (4 byte payload)
    CommandResult(i32),
    /// Reply to the "Bitstream" command
    Bitstream { version: [u8; 4] },
    /// Any other textual reply
    Text(String),
}

/// A decoded message of any kind the client consumes
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ServerInfo(ServerInfo),
    FrameOfData(FrameSummary),
    Response(Response),
    MessageString(String),
    UnrecognizedRequest,
    /// Recognized header, payload not modeled (model definitions etc.)
    Other { id: MessageId, length: usize },
}

// =============================================================================
// Listeners
// =============================================================================

/// Receives marker sets as they are decoded.
///
/// Called synchronously on the receive thread, so implementations must return
/// quickly: the next datagram is not read until the call returns.
pub trait MarkerListener: Send + Sync {
    fn on_marker_set(&self, batch: MarkerBatch) -> Result<(), ListenerError>;
}

/// Receives rigid bodies as they are decoded.
pub trait RigidBodyListener: Send + Sync {
    fn on_rigid_body(&self, body: RigidBody) -> Result<(), ListenerError>;
}

/// The listeners registered for one dispatch, one per category.
#[derive(Clone, Copy, Default)]
pub struct FrameListeners<'a> {
    pub markers: Option<&'a dyn MarkerListener>,
    pub rigid_bodies: Option<&'a dyn RigidBodyListener>,
}

impl<'a> FrameListeners<'a> {
    pub fn none() -> Self {
        FrameListeners::default()
    }

    pub fn with_markers(mut self, listener: &'a dyn MarkerListener) -> Self {
        self.markers = Some(listener);
        self
    }

    pub fn with_rigid_bodies(mut self, listener: &'a dyn RigidBodyListener) -> Self {
        self.rigid_bodies = Some(listener);
        self
    }
}

// =============================================================================
// Parsing Functions
// =============================================================================

/// Bounds-checked cursor over a payload
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ParseError::TooShort {
                expected: self.offset.saturating_add(len),
                actual: self.buf.len(),
            })?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.take(len).map(|_| ())
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn count(&mut self, field: &'static str) -> Result<usize, ParseError> {
        let value = self.i32()?;
        usize::try_from(value).map_err(|_| ParseError::NegativeCount { field, value })
    }

    fn label(&mut self) -> Result<String, ParseError> {
        let (label, len) = read_cstr(self.buf, self.offset)?;
        self.offset += len;
        Ok(label)
    }

    /// Checks that `count` records of `size` bytes fit before decoding any of them
    fn ensure(&self, count: usize, size: usize) -> Result<(), ParseError> {
        let needed = count.checked_mul(size).and_then(|n| n.checked_add(self.offset));
        match needed {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(ParseError::TooShort {
                expected: needed.unwrap_or(usize::MAX),
                actual: self.buf.len(),
            }),
        }
    }
}

/// Peek at the message id of a datagram without decoding it
pub fn peek_message_id(datagram: &[u8]) -> Option<MessageId> {
    if datagram.len() < 2 {
        return None;
    }
    Some(MessageId::from_value(u16::from_le_bytes([
        datagram[0],
        datagram[1],
    ])))
}

/// Parse the 4 byte message header
pub fn parse_header(datagram: &[u8]) -> Result<MessageHeader, ParseError> {
    if datagram.len() < HEADER_SIZE {
        return Err(ParseError::TooShort {
            expected: HEADER_SIZE,
            actual: datagram.len(),
        });
    }
    Ok(MessageHeader {
        id: MessageId::from_value(u16::from_le_bytes([datagram[0], datagram[1]])),
        length: u16::from_le_bytes([datagram[2], datagram[3]]) as usize,
    })
}

fn read_marker_set(reader: &mut Reader<'_>, frame_number: i64) -> Result<MarkerBatch, ParseError> {
    let set_label = reader.label()?;
    let count = reader.count("marker")?;
    reader.ensure(count, MARKER_SIZE)?;

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let record: MarkerRecord = bincode::deserialize(reader.take(MARKER_SIZE)?)?;
        samples.push(RawMarkerSample {
            frame_number,
            x: record.x,
            y: record.y,
            z: record.z,
        });
    }

    Ok(MarkerBatch {
        frame_number,
        set_label,
        samples,
    })
}

fn read_rigid_body(reader: &mut Reader<'_>, frame_number: i64) -> Result<RigidBody, ParseError> {
    let record: RigidBodyRecord = bincode::deserialize(reader.take(RIGID_BODY_SIZE)?)?;
    Ok(RigidBody {
        frame_number,
        id: record.id,
        position: record.position,
        orientation: record.orientation,
        mean_error: record.mean_error,
        flags: TrackingFlags::from_bits_retain(record.tracking),
    })
}

/// Decode a FRAMEOFDATA payload (the bytes following the message header)
///
/// Layout:
/// - i32: frame number
/// - i32: marker set count, then per set a NUL terminated label, an i32
///   marker count and `count` x/y/z f32 triples
/// - i32: rigid body count, then `count` 38 byte rigid body records
pub fn decode_frame_of_data(buf: &[u8]) -> Result<FrameOfData, ParseError> {
    let mut reader = Reader::new(buf);
    let frame_number = reader.i32()? as i64;

    let set_count = reader.count("marker set")?;
    let mut marker_sets = Vec::new();
    for _ in 0..set_count {
        marker_sets.push(read_marker_set(&mut reader, frame_number)?);
    }

    let body_count = reader.count("rigid body")?;
    reader.ensure(body_count, RIGID_BODY_SIZE)?;
    let mut rigid_bodies = Vec::with_capacity(body_count);
    for _ in 0..body_count {
        rigid_bodies.push(read_rigid_body(&mut reader, frame_number)?);
    }

    Ok(FrameOfData {
        frame_number,
        marker_sets,
        rigid_bodies,
        bytes_consumed: reader.offset,
    })
}

/// Walk a FRAMEOFDATA payload and hand each category to its listener.
///
/// Categories without a listener are skipped using the size tables instead
/// of being decoded. Listener failures do not stop the walk, they are
/// returned in the summary. Structural problems in the payload are returned
/// as errors; listeners may already have seen the sets decoded before the
/// problem was found.
pub fn dispatch_frame_of_data(
    buf: &[u8],
    listeners: FrameListeners<'_>,
) -> Result<FrameSummary, ParseError> {
    let mut reader = Reader::new(buf);
    let mut listener_errors = Vec::new();
    let frame_number = reader.i32()? as i64;

    let set_count = reader.count("marker set")?;
    for _ in 0..set_count {
        match listeners.markers {
            Some(listener) => {
                let batch = read_marker_set(&mut reader, frame_number)?;
                if let Err(e) = listener.on_marker_set(batch) {
                    listener_errors.push(e);
                }
            }
            None => {
                reader.label()?;
                let count = reader.count("marker")?;
                reader.ensure(count, MARKER_SIZE)?;
                reader.skip(count * MARKER_SIZE)?;
            }
        }
    }

    let body_count = reader.count("rigid body")?;
    reader.ensure(body_count, RIGID_BODY_SIZE)?;
    match listeners.rigid_bodies {
        Some(listener) => {
            for _ in 0..body_count {
                let body = read_rigid_body(&mut reader, frame_number)?;
                if let Err(e) = listener.on_rigid_body(body) {
                    listener_errors.push(e);
                }
            }
        }
        None => reader.skip(body_count * RIGID_BODY_SIZE)?,
    }

    Ok(FrameSummary {
        frame_number,
        marker_sets: set_count,
        rigid_bodies: body_count,
        bytes_consumed: reader.offset,
        listener_errors,
    })
}

/// Decode the fixed SERVERINFO region starting at `offset`
pub fn decode_server_info(buf: &[u8], offset: usize) -> Result<ServerInfo, ParseError> {
    let end = offset
        .checked_add(SERVER_INFO_SIZE)
        .filter(|&end| end <= buf.len())
        .ok_or(ParseError::TooShort {
            expected: offset.saturating_add(SERVER_INFO_SIZE),
            actual: buf.len(),
        })?;
    let region = &buf[offset..end];
    let application_name = c_string(&region[..SERVER_NAME_LEN]).unwrap_or_default();
    let mut server_version = [0u8; 4];
    server_version.copy_from_slice(&region[SERVER_NAME_LEN..SERVER_NAME_LEN + 4]);
    let mut stream_version = [0u8; 4];
    stream_version.copy_from_slice(&region[SERVER_NAME_LEN + 4..SERVER_INFO_SIZE]);

    Ok(ServerInfo {
        application_name,
        server_version,
        stream_version,
    })
}

/// Parse the version out of a "Bitstream,4.1.0.0" reply
pub fn parse_bitstream_version(text: &str) -> Option<[u8; 4]> {
    let (kind, version) = text.split_once(',')?;
    if kind != "Bitstream" {
        return None;
    }
    let mut parsed = [0u8; 4];
    for (i, part) in version.trim().split('.').enumerate() {
        if i >= parsed.len() {
            break;
        }
        parsed[i] = part.trim().parse().ok()?;
    }
    Some(parsed)
}

/// Decode a RESPONSE payload of the declared `length`
pub fn decode_response(buf: &[u8], length: usize) -> Result<Response, ParseError> {
    if length == 4 {
        if buf.len() < 4 {
            return Err(ParseError::LengthMismatch {
                header_len: length,
                actual_len: buf.len(),
            });
        }
        return Ok(Response::CommandResult(i32::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3],
        ])));
    }

    let (text, _) = read_cstr(buf, 0)?;
    match parse_bitstream_version(&text) {
        Some(version) => Ok(Response::Bitstream { version }),
        None => Ok(Response::Text(text)),
    }
}

/// Decode a MESSAGESTRING payload
pub fn decode_message_string(buf: &[u8]) -> Result<String, ParseError> {
    read_cstr(buf, 0).map(|(text, _)| text)
}

/// Decode one datagram, delivering frame data to `listeners`
pub fn decode_message(
    datagram: &[u8],
    listeners: FrameListeners<'_>,
) -> Result<Message, ParseError> {
    let header = parse_header(datagram)?;
    let payload = &datagram[HEADER_SIZE..];

    let message = match header.id {
        MessageId::FrameOfData => {
            Message::FrameOfData(dispatch_frame_of_data(payload, listeners)?)
        }
        MessageId::ServerInfo => Message::ServerInfo(decode_server_info(datagram, HEADER_SIZE)?),
        MessageId::Response => Message::Response(decode_response(payload, header.length)?),
        MessageId::MessageString => Message::MessageString(decode_message_string(payload)?),
        MessageId::UnrecognizedRequest => Message::UnrecognizedRequest,
        id => Message::Other {
            id,
            length: header.length,
        },
    };
    Ok(message)
}

// =============================================================================
// Message Creation
// =============================================================================

fn header(id: MessageId, length: u16) -> [u8; HEADER_SIZE] {
    let [id_lo, id_hi] = id.value().to_le_bytes();
    let [len_lo, len_hi] = length.to_le_bytes();
    [id_lo, id_hi, len_lo, len_hi]
}

fn with_header(id: MessageId, length: usize, payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    let length = u16::try_from(length).map_err(|_| ParseError::OutOfRange {
        field: "message length",
        value: i64::try_from(length).unwrap_or(i64::MAX),
    })?;
    let mut msg = Vec::with_capacity(HEADER_SIZE + payload.len());
    msg.extend_from_slice(&header(id, length));
    msg.extend_from_slice(payload);
    Ok(msg)
}

/// A request that carries no payload, only the terminating NUL
fn empty_request(id: MessageId) -> Vec<u8> {
    let mut msg = header(id, 0).to_vec();
    msg.push(0);
    msg
}

fn wire_i32(field: &'static str, value: i64) -> Result<[u8; 4], ParseError> {
    i32::try_from(value)
        .map(i32::to_le_bytes)
        .map_err(|_| ParseError::OutOfRange { field, value })
}

fn wire_count(field: &'static str, count: usize) -> Result<[u8; 4], ParseError> {
    wire_i32(field, i64::try_from(count).unwrap_or(i64::MAX))
}

/// Create a request datagram.
///
/// Payload-less requests declare a zero length, all others declare the
/// command length plus its terminator. Every request ends with a NUL.
/// Fails if the command does not fit the 16-bit length field.
pub fn create_request(id: MessageId, command: &str) -> Result<Vec<u8>, ParseError> {
    let length = if id.has_empty_payload() {
        0
    } else {
        command.len() + 1
    };
    let mut payload = Vec::with_capacity(command.len() + 1);
    payload.extend_from_slice(command.as_bytes());
    payload.push(0);
    with_header(id, length, &payload)
}

/// Create the CONNECT request: "Ping", zero padding, then our NatNet version
pub fn create_connect_request() -> Vec<u8> {
    let mut msg = header(MessageId::Connect, CONNECT_PAYLOAD_SIZE as u16).to_vec();
    msg.extend_from_slice(b"Ping");
    msg.extend_from_slice(&[0u8; CONNECT_PADDING]);
    msg.extend_from_slice(&CLIENT_NATNET_VERSION);
    msg.push(0);
    msg
}

/// Ask the server to start sending frame data
pub fn create_frame_of_data_request() -> Vec<u8> {
    empty_request(MessageId::RequestFrameOfData)
}

/// Keep a unicast session alive
pub fn create_keep_alive() -> Vec<u8> {
    empty_request(MessageId::KeepAlive)
}

/// Create a textual NAT_REQUEST command such as "Bitstream"
pub fn create_command(command: &str) -> Result<Vec<u8>, ParseError> {
    create_request(MessageId::Request, command)
}

/// Encode the modeled fields of a frame as a FRAMEOFDATA payload.
///
/// Fails instead of truncating when a frame number or count does not fit
/// its 32-bit wire field.
pub fn encode_frame_of_data(frame: &FrameOfData) -> Result<Vec<u8>, ParseError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&wire_i32("frame number", frame.frame_number)?);
    buf.extend_from_slice(&wire_count("marker set count", frame.marker_sets.len())?);
    for set in &frame.marker_sets {
        buf.extend_from_slice(set.set_label.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&wire_count("marker count", set.samples.len())?);
        for s in &set.samples {
            let record = MarkerRecord {
                x: s.x,
                y: s.y,
                z: s.z,
            };
            buf.extend(bincode::serialize(&record)?);
        }
    }
    buf.extend_from_slice(&wire_count("rigid body count", frame.rigid_bodies.len())?);
    for body in &frame.rigid_bodies {
        let record = RigidBodyRecord {
            id: body.id,
            position: body.position,
            orientation: body.orientation,
            mean_error: body.mean_error,
            tracking: body.flags.bits(),
        };
        buf.extend(bincode::serialize(&record)?);
    }
    Ok(buf)
}

/// Create a complete FRAMEOFDATA datagram, header included
pub fn create_frame_of_data_message(frame: &FrameOfData) -> Result<Vec<u8>, ParseError> {
    let payload = encode_frame_of_data(frame)?;
    with_header(MessageId::FrameOfData, payload.len(), &payload)
}

/// Create a complete SERVERINFO datagram
pub fn create_server_info_message(info: &ServerInfo) -> Vec<u8> {
    let mut msg = header(MessageId::ServerInfo, SERVER_INFO_SIZE as u16).to_vec();
    let mut payload = [0u8; SERVER_INFO_SIZE];
    let name = info.application_name.as_bytes();
    let name_len = name.len().min(SERVER_NAME_LEN - 1);
    payload[..name_len].copy_from_slice(&name[..name_len]);
    payload[SERVER_NAME_LEN..SERVER_NAME_LEN + 4].copy_from_slice(&info.server_version);
    payload[SERVER_NAME_LEN + 4..].copy_from_slice(&info.stream_version);
    msg.extend_from_slice(&payload);
    msg
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Hand-built payload: frame 42, one "hand" set with two markers,
    /// one rigid body with the tracking bit set.
    fn sample_payload() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&42i32.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(b"hand\0");
        buf.extend_from_slice(&2i32.to_le_bytes());
        for v in [0.1f32, 0.2, 0.3, 1.1, 1.2, 1.3] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&7i32.to_le_bytes());
        for v in [1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0, 0.0005] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&0x01i16.to_le_bytes());
        buf
    }

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<MarkerBatch>>,
        bodies: Mutex<Vec<RigidBody>>,
    }

    impl MarkerListener for Collect {
        fn on_marker_set(&self, batch: MarkerBatch) -> Result<(), ListenerError> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    impl RigidBodyListener for Collect {
        fn on_rigid_body(&self, body: RigidBody) -> Result<(), ListenerError> {
            self.bodies.lock().unwrap().push(body);
            Ok(())
        }
    }

    struct Failing;

    impl MarkerListener for Failing {
        fn on_marker_set(&self, _batch: MarkerBatch) -> Result<(), ListenerError> {
            Err(ListenerError::new("disk full"))
        }
    }

    #[test]
    fn test_message_id_values() {
        assert_eq!(MessageId::from_value(7), MessageId::FrameOfData);
        assert_eq!(MessageId::from_value(100), MessageId::UnrecognizedRequest);
        assert_eq!(MessageId::from_value(55), MessageId::Unknown(55));
        assert_eq!(MessageId::KeepAlive.value(), 10);
        assert_eq!(MessageId::Unknown(55).value(), 55);
    }

    #[test]
    fn test_parse_header() {
        let header = parse_header(&[0x07, 0x00, 0x10, 0x01, 0xff]).unwrap();
        assert_eq!(header.id, MessageId::FrameOfData);
        assert_eq!(header.length, 0x0110);
        assert!(matches!(
            parse_header(&[0x07, 0x00]),
            Err(ParseError::TooShort { expected: 4, .. })
        ));
        assert_eq!(peek_message_id(&[0x01, 0x00]), Some(MessageId::ServerInfo));
        assert_eq!(peek_message_id(&[0x01]), None);
    }

    #[test]
    fn test_decode_frame_of_data() {
        let payload = sample_payload();
        let frame = decode_frame_of_data(&payload).unwrap();

        assert_eq!(frame.frame_number, 42);
        assert_eq!(frame.bytes_consumed, payload.len());
        assert_eq!(frame.marker_sets.len(), 1);

        let set = &frame.marker_sets[0];
        assert_eq!(set.set_label, "hand");
        assert_eq!(set.samples.len(), 2);
        assert_eq!(set.samples[1].frame_number, 42);
        assert!((set.samples[1].z - 1.3).abs() < 1e-6);

        let body = &frame.rigid_bodies[0];
        assert_eq!(body.id, 7);
        assert_eq!(body.position, [1.0, 2.0, 3.0]);
        assert!(body.tracking_valid());
    }

    #[test]
    fn test_encode_reproduces_payload() {
        let payload = sample_payload();
        let frame = decode_frame_of_data(&payload).unwrap();
        assert_eq!(encode_frame_of_data(&frame).unwrap(), payload);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let mut payload = sample_payload();
        let len = payload.len();
        payload.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode_frame_of_data(&payload).unwrap().bytes_consumed, len);
    }

    #[test]
    fn test_empty_frame() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5i32.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        let frame = decode_frame_of_data(&payload).unwrap();
        assert_eq!(frame.frame_number, 5);
        assert!(frame.marker_sets.is_empty());
        assert!(frame.rigid_bodies.is_empty());
        assert_eq!(frame.bytes_consumed, 12);
    }

    #[test]
    fn test_rigid_body_not_tracked() {
        let mut payload = sample_payload();
        let len = payload.len();
        payload[len - 2..].copy_from_slice(&0x02i16.to_le_bytes());
        let frame = decode_frame_of_data(&payload).unwrap();
        assert!(!frame.rigid_bodies[0].tracking_valid());
        assert_eq!(frame.rigid_bodies[0].flags.bits(), 0x02);
    }

    #[test]
    fn test_truncated_markers() {
        let payload = sample_payload();
        // Cut inside the second marker
        let cut = 4 + 4 + 5 + 4 + MARKER_SIZE + 4;
        assert!(matches!(
            decode_frame_of_data(&payload[..cut]),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn test_declared_count_past_end() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&1000i32.to_le_bytes());
        payload.extend_from_slice(&[0u8; RIGID_BODY_SIZE]);
        assert!(matches!(
            decode_frame_of_data(&payload),
            Err(ParseError::TooShort { .. })
        ));
        assert!(matches!(
            dispatch_frame_of_data(&payload, FrameListeners::none()),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn test_label_without_terminator() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(b"hand");
        assert!(matches!(
            decode_frame_of_data(&payload),
            Err(ParseError::MissingTerminator { offset: 8 })
        ));
    }

    #[test]
    fn test_negative_count() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&(-3i32).to_le_bytes());
        assert_eq!(
            decode_frame_of_data(&payload),
            Err(ParseError::NegativeCount {
                field: "marker set",
                value: -3
            })
        );
    }

    #[test]
    fn test_dispatch_to_listeners() {
        let payload = sample_payload();
        let collect = Collect::default();
        let listeners = FrameListeners::none()
            .with_markers(&collect)
            .with_rigid_bodies(&collect);

        let summary = dispatch_frame_of_data(&payload, listeners).unwrap();
        assert_eq!(summary.frame_number, 42);
        assert_eq!(summary.marker_sets, 1);
        assert_eq!(summary.rigid_bodies, 1);
        assert_eq!(summary.bytes_consumed, payload.len());
        assert!(summary.listener_errors.is_empty());

        let decoded = decode_frame_of_data(&payload).unwrap();
        assert_eq!(*collect.batches.lock().unwrap(), decoded.marker_sets);
        assert_eq!(*collect.bodies.lock().unwrap(), decoded.rigid_bodies);
    }

    #[test]
    fn test_dispatch_without_listeners_skips() {
        let payload = sample_payload();
        let summary = dispatch_frame_of_data(&payload, FrameListeners::none()).unwrap();
        assert_eq!(summary.bytes_consumed, payload.len());
        assert_eq!(summary.marker_sets, 1);
        assert_eq!(summary.rigid_bodies, 1);
    }

    #[test]
    fn test_dispatch_collects_listener_errors() {
        let payload = sample_payload();
        let summary =
            dispatch_frame_of_data(&payload, FrameListeners::none().with_markers(&Failing))
                .unwrap();
        assert_eq!(summary.listener_errors, vec![ListenerError::new("disk full")]);
        assert_eq!(summary.bytes_consumed, payload.len());
    }

    #[test]
    fn test_server_info() {
        let info = ServerInfo {
            application_name: "Motive".to_string(),
            server_version: [3, 1, 0, 0],
            stream_version: [4, 1, 0, 0],
        };
        let msg = create_server_info_message(&info);
        assert_eq!(msg.len(), HEADER_SIZE + SERVER_INFO_SIZE);
        assert_eq!(decode_server_info(&msg, HEADER_SIZE).unwrap(), info);
        assert!(matches!(
            decode_server_info(&msg[..100], HEADER_SIZE),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(
            decode_response(&7i32.to_le_bytes(), 4).unwrap(),
            Response::CommandResult(7)
        );
        assert_eq!(
            decode_response(b"Bitstream,4.1.0.0\0", 18).unwrap(),
            Response::Bitstream {
                version: [4, 1, 0, 0]
            }
        );
        assert_eq!(
            decode_response(b"Bitstream,3.1\0", 14).unwrap(),
            Response::Bitstream {
                version: [3, 1, 0, 0]
            }
        );
        assert_eq!(
            decode_response(b"OK\0", 3).unwrap(),
            Response::Text("OK".to_string())
        );
    }

    #[test]
    fn test_decode_message_routes() {
        let msg = create_frame_of_data_message(&decode_frame_of_data(&sample_payload()).unwrap())
            .unwrap();
        match decode_message(&msg, FrameListeners::none()).unwrap() {
            Message::FrameOfData(summary) => assert_eq!(summary.frame_number, 42),
            other => panic!("Expected FrameOfData, got {:?}", other),
        }

        let mut text = vec![8, 0, 6, 0];
        text.extend_from_slice(b"hello\0");
        assert_eq!(
            decode_message(&text, FrameListeners::none()).unwrap(),
            Message::MessageString("hello".to_string())
        );

        assert_eq!(
            decode_message(&[100, 0, 0, 0], FrameListeners::none()).unwrap(),
            Message::UnrecognizedRequest
        );
        assert_eq!(
            decode_message(&[5, 0, 2, 0, 0, 0], FrameListeners::none()).unwrap(),
            Message::Other {
                id: MessageId::ModelDef,
                length: 2
            }
        );
    }

    #[test]
    fn test_create_keep_alive() {
        assert_eq!(create_keep_alive(), vec![10, 0, 0, 0, 0]);
        assert_eq!(create_frame_of_data_request(), vec![6, 0, 0, 0, 0]);
    }

    #[test]
    fn test_create_command() {
        let cmd = create_command("Bitstream").unwrap();
        assert_eq!(&cmd[0..2], &2u16.to_le_bytes());
        assert_eq!(u16::from_le_bytes([cmd[2], cmd[3]]), 10);
        assert_eq!(&cmd[4..], b"Bitstream\0");
    }

    #[test]
    fn test_create_connect_request() {
        let cmd = create_connect_request();
        let header = parse_header(&cmd).unwrap();
        assert_eq!(header.id, MessageId::Connect);
        assert_eq!(header.length, cmd.len() - HEADER_SIZE);
        assert_eq!(&cmd[4..8], b"Ping");
        assert!(cmd[8..8 + CONNECT_PADDING].iter().all(|&b| b == 0));
        assert_eq!(&cmd[8 + CONNECT_PADDING..cmd.len() - 1], &CLIENT_NATNET_VERSION);
        assert_eq!(cmd[cmd.len() - 1], 0);
    }

    #[test]
    fn test_encode_rejects_values_that_do_not_fit() {
        let frame = FrameOfData {
            frame_number: i64::from(i32::MAX) + 1,
            marker_sets: vec![],
            rigid_bodies: vec![],
            bytes_consumed: 0,
        };
        assert!(matches!(
            encode_frame_of_data(&frame),
            Err(ParseError::OutOfRange {
                field: "frame number",
                ..
            })
        ));

        // Payload larger than the 16-bit length field
        let frame = FrameOfData {
            frame_number: 1,
            marker_sets: vec![MarkerBatch {
                frame_number: 1,
                set_label: "hand".to_string(),
                samples: vec![
                    RawMarkerSample {
                        frame_number: 1,
                        x: 0.0,
                        y: 0.0,
                        z: 0.0,
                    };
                    6000
                ],
            }],
            rigid_bodies: vec![],
            bytes_consumed: 0,
        };
        assert!(encode_frame_of_data(&frame).is_ok());
        assert!(matches!(
            create_frame_of_data_message(&frame),
            Err(ParseError::OutOfRange {
                field: "message length",
                ..
            })
        ));
    }

    #[test]
    fn test_create_command_too_long() {
        let command = "x".repeat(usize::from(u16::MAX));
        assert!(matches!(
            create_command(&command),
            Err(ParseError::OutOfRange { .. })
        ));
        assert!(create_command(&command[1..]).is_ok());
    }

    #[test]
    fn test_server_info_offset_overflow() {
        let msg = create_server_info_message(&ServerInfo {
            application_name: "Motive".to_string(),
            server_version: [3, 1, 0, 0],
            stream_version: [4, 1, 0, 0],
        });
        assert!(matches!(
            decode_server_info(&msg, usize::MAX),
            Err(ParseError::TooShort { .. })
        ));
        assert!(decode_server_info(&msg, HEADER_SIZE).is_ok());
    }
}
