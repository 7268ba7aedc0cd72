//! # ZK Wire Format
//!
//! Pure encoding and decoding for the ZKTeco binary protocol over TCP.
//! Nothing in here touches a socket.
//!
//! ## Frame Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         TCP Frame                                       │
//! │                                                                         │
//! │  ┌────────────┬────────────┬──────────────────────────────────────────┐│
//! │  │ 50 50 82 7d│ length u32 │ packet (length bytes)                    ││
//! │  └────────────┴────────────┴──────────────────────────────────────────┘│
//! │                                                                         │
//! │  packet:                                                               │
//! │  ┌──────────┬──────────┬────────────┬──────────┬───────────────────┐  │
//! │  │ cmd u16  │ csum u16 │ session u16│ reply u16│ payload ...       │  │
//! │  └──────────┴──────────┴────────────┴──────────┴───────────────────┘  │
//! │                                                                         │
//! │  All integers little-endian. The checksum covers the packet with the  │
//! │  previous reply id; the id written to the header is the next one.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Record Formats
//! - Attendance: 8, 16 or 40 bytes per record depending on firmware
//! - Users: 28 bytes (numeric ids, short names) or 72 bytes

use chrono::{NaiveDate, NaiveDateTime};
use tracing::warn;

use tally_core::{TerminalEvent, TerminalUser, UserProvision};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Constants
// =============================================================================

/// Command and reply codes.
pub mod cmd {
    pub const CONNECT: u16 = 1000;
    pub const EXIT: u16 = 1001;
    pub const ENABLE_DEVICE: u16 = 1002;
    pub const DISABLE_DEVICE: u16 = 1003;
    pub const REFRESH_DATA: u16 = 1013;
    pub const AUTH: u16 = 1102;

    pub const USER_WRQ: u16 = 8;
    pub const USERTEMP_RRQ: u16 = 9;
    pub const OPTIONS_RRQ: u16 = 11;
    pub const ATTLOG_RRQ: u16 = 13;
    pub const GET_FREE_SIZES: u16 = 50;

    pub const PREPARE_DATA: u16 = 1500;
    pub const DATA: u16 = 1501;
    pub const FREE_DATA: u16 = 1502;
    pub const PREPARE_BUFFER: u16 = 1503;
    pub const READ_BUFFER: u16 = 1504;

    pub const ACK_OK: u16 = 2000;
    pub const ACK_ERROR: u16 = 2001;
    pub const ACK_DATA: u16 = 2002;
    pub const ACK_UNAUTH: u16 = 2005;
}

/// Function code selecting the user table in a buffered read.
pub const FCT_USER: i32 = 5;

/// Default TCP port of the terminal.
pub const DEFAULT_PORT: u16 = 4370;

/// Largest chunk a single `READ_BUFFER` may request over TCP.
pub const MAX_CHUNK: usize = 0xFFC0;

/// Length of the command header.
pub const HEADER_LEN: usize = 8;

/// Length of the TCP envelope.
pub const TCP_TOP_LEN: usize = 8;

/// Ticks value mixed into the comm key.
pub const COMMKEY_TICKS: u8 = 50;

/// Reply id a fresh connection starts from.
pub const INITIAL_REPLY_ID: u16 = USHRT_MAX as u16 - 1;

/// Frames larger than this are treated as garbage.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const TCP_MAGIC: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];
const USHRT_MAX: i64 = 65535;

pub const ATT_RECORD_COMPACT: usize = 8;
pub const ATT_RECORD_STANDARD: usize = 16;
pub const ATT_RECORD_EXTENDED: usize = 40;

pub const USER_RECORD_COMPACT: usize = 28;
pub const USER_RECORD_EXTENDED: usize = 72;

// =============================================================================
// Framing
// =============================================================================

/// Computes the packet checksum.
pub fn checksum(packet: &[u8]) -> u16 {
    let mut sum: i64 = 0;

    let mut words = packet.chunks_exact(2);
    for word in &mut words {
        sum += i64::from(u16::from_le_bytes([word[0], word[1]]));
        if sum > USHRT_MAX {
            sum -= USHRT_MAX;
        }
    }
    if let [last] = words.remainder() {
        sum += i64::from(*last);
    }
    while sum > USHRT_MAX {
        sum -= USHRT_MAX;
    }

    let mut sum = !sum;
    while sum < 0 {
        sum += USHRT_MAX;
    }
    sum as u16
}

/// Advances a reply id, wrapping below 65535.
pub fn next_reply_id(reply_id: u16) -> u16 {
    let next = i64::from(reply_id) + 1;
    if next >= USHRT_MAX {
        (next - USHRT_MAX) as u16
    } else {
        next as u16
    }
}

/// Builds a complete TCP frame for one command.
///
/// Returns the frame and the reply id written into it.
pub fn encode_command(
    command: u16,
    session_id: u16,
    reply_id: u16,
    payload: &[u8],
) -> (Vec<u8>, u16) {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&command.to_le_bytes());
    packet.extend_from_slice(&0u16.to_le_bytes());
    packet.extend_from_slice(&session_id.to_le_bytes());
    packet.extend_from_slice(&reply_id.to_le_bytes());
    packet.extend_from_slice(payload);

    let sum = checksum(&packet);
    let sent_reply_id = next_reply_id(reply_id);
    packet[2..4].copy_from_slice(&sum.to_le_bytes());
    packet[6..8].copy_from_slice(&sent_reply_id.to_le_bytes());

    let mut frame = Vec::with_capacity(TCP_TOP_LEN + packet.len());
    frame.extend_from_slice(&TCP_MAGIC);
    frame.extend_from_slice(&(packet.len() as u32).to_le_bytes());
    frame.extend_from_slice(&packet);
    (frame, sent_reply_id)
}

/// Validates a TCP envelope and returns the packet length that follows.
pub fn parse_tcp_top(top: &[u8; TCP_TOP_LEN]) -> SyncResult<usize> {
    if top[..4] != TCP_MAGIC {
        return Err(SyncError::ProtocolViolation(format!(
            "bad frame magic {:02x?}",
            &top[..4]
        )));
    }

    let len = u32::from_le_bytes([top[4], top[5], top[6], top[7]]) as usize;
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(SyncError::ProtocolViolation(format!(
            "frame length {len} out of range"
        )));
    }
    Ok(len)
}

/// Command header of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub checksum: u16,
    pub session_id: u16,
    pub reply_id: u16,
}

impl Header {
    /// Decodes the first eight bytes of a packet.
    pub fn decode(packet: &[u8]) -> SyncResult<Self> {
        if packet.len() < HEADER_LEN {
            return Err(SyncError::ProtocolViolation(format!(
                "packet of {} bytes has no header",
                packet.len()
            )));
        }
        Ok(Header {
            command: le_u16(packet, 0),
            checksum: le_u16(packet, 2),
            session_id: le_u16(packet, 4),
            reply_id: le_u16(packet, 6),
        })
    }
}

/// Derives the 4-byte authentication key from the comm password.
pub fn make_commkey(password: u32, session_id: u16, ticks: u8) -> [u8; 4] {
    let key = password.reverse_bits().wrapping_add(u32::from(session_id));
    let b = key.to_le_bytes();
    let mixed = [b[0] ^ b'Z', b[1] ^ b'K', b[2] ^ b'S', b[3] ^ b'O'];
    let swapped = [mixed[2], mixed[3], mixed[0], mixed[1]];
    [
        swapped[0] ^ ticks,
        swapped[1] ^ ticks,
        ticks,
        swapped[3] ^ ticks,
    ]
}

// =============================================================================
// Request Payloads
// =============================================================================

/// `PREPARE_BUFFER` payload: `<bhii` (1, command, fct, ext).
pub fn buffer_request(command: u16, fct: i32, ext: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(1);
    buf.extend_from_slice(&command.to_le_bytes());
    buf.extend_from_slice(&fct.to_le_bytes());
    buf.extend_from_slice(&ext.to_le_bytes());
    buf
}

/// `READ_BUFFER` payload: `<ii` (start, size).
pub fn chunk_request(start: usize, size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&(start as i32).to_le_bytes());
    buf.extend_from_slice(&(size as i32).to_le_bytes());
    buf
}

/// Splits a buffered read into `(start, size)` chunk requests.
pub fn chunk_plan(total: usize) -> Vec<(usize, usize)> {
    (0..total)
        .step_by(MAX_CHUNK)
        .map(|start| (start, MAX_CHUNK.min(total - start)))
        .collect()
}

// =============================================================================
// Reply Payloads
// =============================================================================

/// Record counters reported by `GET_FREE_SIZES`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeSizes {
    pub users: i32,
    pub records: i32,
}

/// Parses the `GET_FREE_SIZES` reply (twenty little-endian i32 fields).
pub fn parse_free_sizes(payload: &[u8]) -> SyncResult<FreeSizes> {
    if payload.len() < 80 {
        return Err(SyncError::ProtocolViolation(format!(
            "free sizes reply of {} bytes",
            payload.len()
        )));
    }
    Ok(FreeSizes {
        users: le_i32(payload, 16),
        records: le_i32(payload, 32),
    })
}

/// Extracts the value of a `~Key=Value\0` option reply.
pub fn parse_option_value(payload: &[u8]) -> String {
    let value = match payload.iter().position(|&b| b == b'=') {
        Some(eq) => &payload[eq + 1..],
        None => payload,
    };
    let cut = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..cut])
        .replace('=', "")
        .trim()
        .to_string()
}

/// Reads the declared total size of a buffered read and the records after it.
///
/// Returns `None` when the buffer is too short to hold the size field.
pub fn split_table(buffer: &[u8]) -> Option<(usize, &[u8])> {
    if buffer.len() < 4 {
        return None;
    }
    Some((le_u32(buffer, 0) as usize, &buffer[4..]))
}

/// Record width implied by a table's total size and its record count.
pub fn record_width(total: usize, count: i32) -> usize {
    match usize::try_from(count) {
        Ok(count) if count > 0 => total / count,
        _ => 0,
    }
}

// =============================================================================
// Time
// =============================================================================

/// Decodes the packed timestamp used in attendance records.
///
/// Returns `None` for values that don't name a real date (e.g. day 31 of a
/// 30-day month).
pub fn decode_time(raw: u32) -> Option<NaiveDateTime> {
    let mut t = raw;
    let second = t % 60;
    t /= 60;
    let minute = t % 60;
    t /= 60;
    let hour = t % 24;
    t /= 24;
    let day = t % 31 + 1;
    t /= 31;
    let month = t % 12 + 1;
    t /= 12;
    let year = i32::try_from(t).ok()? + 2000;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

// =============================================================================
// Attendance Records
// =============================================================================

/// Decodes an attendance table.
///
/// `users` is only consulted by the 8-byte format, which stores the slot
/// number instead of the enrollment id.
pub fn decode_attendance(
    records: &[u8],
    width: usize,
    users: &[TerminalUser],
) -> SyncResult<Vec<TerminalEvent>> {
    if !matches!(
        width,
        ATT_RECORD_COMPACT | ATT_RECORD_STANDARD | ATT_RECORD_EXTENDED
    ) {
        return Err(SyncError::UnsupportedRecord {
            kind: "attendance",
            size: width,
        });
    }

    let mut events = Vec::with_capacity(records.len() / width);
    for record in records.chunks_exact(width) {
        let (user_id, raw_time, status, punch, work_code) = match width {
            ATT_RECORD_COMPACT => {
                let uid = le_u16(record, 0);
                let user_id = users
                    .iter()
                    .find(|u| u.uid == uid)
                    .map(|u| u.user_id.clone())
                    .unwrap_or_else(|| uid.to_string());
                (user_id, le_u32(record, 3), record[2], record[7], None)
            }
            ATT_RECORD_STANDARD => {
                let work_code = le_u32(record, 12);
                (
                    le_u32(record, 0).to_string(),
                    le_u32(record, 4),
                    record[8],
                    record[9],
                    (work_code != 0).then_some(work_code),
                )
            }
            _ => (
                c_string(&record[2..26]),
                le_u32(record, 27),
                record[26],
                record[31],
                None,
            ),
        };

        let Some(timestamp) = decode_time(raw_time) else {
            warn!(user_id = %user_id, raw_time, "Skipping record with invalid timestamp");
            continue;
        };

        events.push(TerminalEvent {
            user_id,
            timestamp,
            punch,
            status,
            work_code,
        });
    }
    Ok(events)
}

// =============================================================================
// User Records
// =============================================================================

/// Decodes a user table.
pub fn decode_users(records: &[u8], width: usize) -> SyncResult<Vec<TerminalUser>> {
    let users = match width {
        USER_RECORD_COMPACT => records
            .chunks_exact(width)
            .map(|r| TerminalUser {
                uid: le_u16(r, 0),
                user_id: le_u32(r, 24).to_string(),
                name: c_string(&r[8..16]),
            })
            .collect(),
        USER_RECORD_EXTENDED => records
            .chunks_exact(width)
            .map(|r| TerminalUser {
                uid: le_u16(r, 0),
                user_id: c_string(&r[48..72]),
                name: c_string(&r[11..35]),
            })
            .collect(),
        _ => {
            return Err(SyncError::UnsupportedRecord {
                kind: "user",
                size: width,
            })
        }
    };
    Ok(users)
}

/// Encodes a `USER_WRQ` payload in the terminal's user record format.
///
/// Names longer than the field are cut at a character boundary; an id that
/// doesn't fit is an error.
pub fn encode_user(user: &UserProvision, uid: u16, width: usize) -> SyncResult<Vec<u8>> {
    let unencodable = |reason: String| SyncError::UnencodableUser {
        user_id: user.user_id.clone(),
        reason,
    };

    let mut buf = Vec::with_capacity(width);
    buf.extend_from_slice(&uid.to_le_bytes());
    buf.push(user.privilege);

    match width {
        USER_RECORD_COMPACT => {
            let user_id: u32 = user
                .user_id
                .parse()
                .map_err(|_| unencodable("28-byte records need a numeric id".into()))?;
            let group: u8 = if user.group_id.is_empty() {
                0
            } else {
                user.group_id
                    .parse()
                    .map_err(|_| unencodable(format!("group '{}' is not numeric", user.group_id)))?
            };

            put_fixed(&mut buf, &user.password, 5);
            put_fixed(&mut buf, &user.name, 8);
            buf.extend_from_slice(&user.card.to_le_bytes());
            buf.push(0);
            buf.push(group);
            buf.extend_from_slice(&0u16.to_le_bytes()); // timezone
            buf.extend_from_slice(&user_id.to_le_bytes());
        }
        USER_RECORD_EXTENDED => {
            if user.user_id.len() > 24 {
                return Err(unencodable("id longer than 24 bytes".into()));
            }
            put_fixed(&mut buf, &user.password, 8);
            put_fixed(&mut buf, &user.name, 24);
            buf.extend_from_slice(&user.card.to_le_bytes());
            buf.push(0);
            put_fixed(&mut buf, &user.group_id, 7);
            buf.push(0);
            put_fixed(&mut buf, &user.user_id, 24);
        }
        _ => {
            return Err(SyncError::UnsupportedRecord {
                kind: "user",
                size: width,
            })
        }
    }

    debug_assert_eq!(buf.len(), width);
    Ok(buf)
}

// =============================================================================
// Byte Helpers
// =============================================================================

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// NUL-terminated, possibly NUL-padded text.
fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Writes `text` into a zero-padded field of `len` bytes.
fn put_fixed(buf: &mut Vec<u8>, text: &str, len: usize) {
    let mut end = text.len().min(len);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&text.as_bytes()[..end]);
    buf.resize(buf.len() + (len - end), 0);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Inverse of [`decode_time`].
    pub(crate) fn encode_time(ts: NaiveDateTime) -> u32 {
        use chrono::{Datelike, Timelike};
        let days = (ts.year() as u32 % 100) * 12 * 31 + (ts.month() - 1) * 31 + ts.day() - 1;
        days * 86_400 + (ts.hour() * 60 + ts.minute()) * 60 + ts.second()
    }

    /// 31 February 2024.
    const INVALID_TIME: u32 = (24 * 12 * 31 + 31 + 30) * 86_400;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_connect_frame_matches_device_capture() {
        let (frame, sent) = encode_command(cmd::CONNECT, 0, INITIAL_REPLY_ID, &[]);
        assert_eq!(
            frame,
            vec![0x50, 0x50, 0x82, 0x7d, 0x08, 0x00, 0x00, 0x00, 0xe8, 0x03, 0x17, 0xfc, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 1000 + 0 + 0 + 1, then the trailing byte 7
        let packet = [0xe8, 0x03, 0, 0, 0, 0, 0x01, 0x00, 0x07];
        assert_eq!(checksum(&packet), 65534 - 1008);
    }

    #[test]
    fn test_reply_id_wraps() {
        assert_eq!(next_reply_id(0), 1);
        assert_eq!(next_reply_id(65533), 65534);
        assert_eq!(next_reply_id(65534), 0);
    }

    #[test]
    fn test_commkey() {
        assert_eq!(make_commkey(0, 0x1234, COMMKEY_TICKS), [0x61, 0x7d, 0x32, 0x6b]);
        assert_eq!(make_commkey(1, 0x1234, COMMKEY_TICKS), [0x61, 0xfd, 0x32, 0x6b]);
    }

    #[test]
    fn test_tcp_top_validation() {
        assert_eq!(parse_tcp_top(&[0x50, 0x50, 0x82, 0x7d, 16, 0, 0, 0]).unwrap(), 16);
        assert!(parse_tcp_top(&[0x50, 0x50, 0x82, 0x7e, 16, 0, 0, 0]).is_err());
        assert!(parse_tcp_top(&[0x50, 0x50, 0x82, 0x7d, 4, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_buffer_requests() {
        assert_eq!(
            buffer_request(cmd::USERTEMP_RRQ, FCT_USER, 0),
            vec![1, 9, 0, 5, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(chunk_plan(10), vec![(0, 10)]);
        assert_eq!(
            chunk_plan(MAX_CHUNK * 2 + 5),
            vec![(0, MAX_CHUNK), (MAX_CHUNK, MAX_CHUNK), (MAX_CHUNK * 2, 5)]
        );
        assert!(chunk_plan(0).is_empty());
    }

    #[test]
    fn test_option_value() {
        assert_eq!(parse_option_value(b"~SerialNumber=CQZ7231\0\0"), "CQZ7231");
        assert_eq!(parse_option_value(b"\0"), "");
    }

    #[test]
    fn test_time_codec() {
        let ts = at(2024, 2, 29, 23, 59, 58);
        assert_eq!(decode_time(encode_time(ts)), Some(ts));
        assert_eq!(decode_time(0), Some(at(2000, 1, 1, 0, 0, 0)));

        assert_eq!(decode_time(INVALID_TIME), None);
    }

    #[test]
    fn test_decode_compact_attendance_maps_uid() {
        let users = vec![TerminalUser {
            uid: 3,
            user_id: "1003".into(),
            name: "Ana".into(),
        }];
        let mut rec = Vec::new();
        for uid in [3u16, 9] {
            rec.extend_from_slice(&uid.to_le_bytes());
            rec.push(1);
            rec.extend_from_slice(&encode_time(at(2024, 3, 1, 8, 0, 0)).to_le_bytes());
            rec.push(4);
        }

        let events = decode_attendance(&rec, ATT_RECORD_COMPACT, &users).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].user_id, "1003");
        assert_eq!(events[1].user_id, "9");
        assert_eq!(events[0].status, 1);
        assert_eq!(events[0].punch, 4);
    }

    #[test]
    fn test_decode_extended_attendance_skips_bad_time() {
        let mut rec = vec![0u8; 80];
        rec[2..6].copy_from_slice(b"4711");
        rec[26] = 15;
        rec[27..31].copy_from_slice(&encode_time(at(2024, 3, 1, 8, 30, 0)).to_le_bytes());
        rec[31] = 1;
        rec[40 + 27..40 + 31].copy_from_slice(&INVALID_TIME.to_le_bytes());

        let events = decode_attendance(&rec, ATT_RECORD_EXTENDED, &[]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "4711");
        assert_eq!(events[0].timestamp, at(2024, 3, 1, 8, 30, 0));
        assert_eq!(events[0].status, 15);
    }

    #[test]
    fn test_unknown_record_width() {
        assert!(matches!(
            decode_attendance(&[0; 12], 12, &[]),
            Err(SyncError::UnsupportedRecord { size: 12, .. })
        ));
        assert!(decode_users(&[0; 30], 30).is_err());
    }

    #[test]
    fn test_user_record_layouts() {
        let user = UserProvision::new("1001", "Ana Lima Souza");

        let extended = encode_user(&user, 7, USER_RECORD_EXTENDED).unwrap();
        assert_eq!(extended.len(), 72);
        let decoded = decode_users(&extended, USER_RECORD_EXTENDED).unwrap();
        assert_eq!(decoded[0].uid, 7);
        assert_eq!(decoded[0].user_id, "1001");
        assert_eq!(decoded[0].name, "Ana Lima Souza");

        let compact = encode_user(&user, 7, USER_RECORD_COMPACT).unwrap();
        assert_eq!(compact.len(), 28);
        let decoded = decode_users(&compact, USER_RECORD_COMPACT).unwrap();
        assert_eq!(decoded[0].user_id, "1001");
        assert_eq!(decoded[0].name, "Ana Lima");
    }

    #[test]
    fn test_compact_format_needs_numeric_id() {
        let user = UserProvision::new("A-17", "Bo");
        assert!(matches!(
            encode_user(&user, 1, USER_RECORD_COMPACT),
            Err(SyncError::UnencodableUser { .. })
        ));
    }

    #[test]
    fn test_free_sizes() {
        let mut payload = vec![0u8; 80];
        payload[16..20].copy_from_slice(&12i32.to_le_bytes());
        payload[32..36].copy_from_slice(&345i32.to_le_bytes());
        assert_eq!(
            parse_free_sizes(&payload).unwrap(),
            FreeSizes { users: 12, records: 345 }
        );
        assert!(parse_free_sizes(&payload[..40]).is_err());
        assert_eq!(record_width(690, 345), 2);
        assert_eq!(record_width(690, 0), 0);
    }
}
