//! # ZK TCP Client
//!
//! Production terminal driver speaking the ZKTeco binary protocol.
//!
//! ## Conversation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     One Session on the Wire                             │
//! │                                                                         │
//! │  Collector                                       Terminal :4370        │
//! │     │── CONNECT ──────────────────────────────────────►│                │
//! │     │◄───────────────────── ACK_OK | ACK_UNAUTH (session id)           │
//! │     │── AUTH(commkey) ─ (only when unauthorized) ─────►│                │
//! │     │── DISABLE_DEVICE ───────────────────────────────►│                │
//! │     │── OPTIONS_RRQ "~SerialNumber" ──────────────────►│                │
//! │     │── GET_FREE_SIZES ───────────────────────────────►│ record counts  │
//! │     │── PREPARE_BUFFER(ATTLOG_RRQ) ───────────────────►│                │
//! │     │◄──────────────────────── DATA (small) | ACK_OK(size)             │
//! │     │── READ_BUFFER(start, ≤0xFFC0) × n ──────────────►│                │
//! │     │◄──────────── DATA | PREPARE_DATA, DATA..., ACK_OK                │
//! │     │── FREE_DATA ────────────────────────────────────►│                │
//! │     │── ENABLE_DEVICE ────────────────────────────────►│                │
//! │     │── EXIT ─────────────────────────────────────────►│                │
//! │                                                                         │
//! │  Every read and write is bounded by the configured socket timeout.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod protocol;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use tally_core::{TerminalEvent, TerminalUser, UserProvision};

use self::protocol::{cmd, FreeSizes, Header};
use super::{Terminal, TerminalConnector};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Options
// =============================================================================

/// Where and how to reach the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkOptions {
    /// Host name or IP address.
    pub address: String,

    /// TCP port.
    pub port: u16,

    /// Numeric comm password (0 = none).
    pub password: u32,

    /// Bound on every socket operation.
    pub timeout: Duration,
}

impl ZkOptions {
    /// Options with the device defaults for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        ZkOptions {
            address: address.into(),
            port: protocol::DEFAULT_PORT,
            password: 0,
            timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens TCP conversations with one terminal.
#[derive(Debug, Clone)]
pub struct ZkConnector {
    options: ZkOptions,
}

impl ZkConnector {
    pub fn new(options: ZkOptions) -> Self {
        ZkConnector { options }
    }
}

#[async_trait]
impl TerminalConnector for ZkConnector {
    fn address(&self) -> &str {
        &self.options.address
    }

    async fn connect(&self) -> SyncResult<Box<dyn Terminal>> {
        let connection = ZkConnection::open(&self.options).await?;
        Ok(Box::new(connection))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A decoded reply packet.
#[derive(Debug)]
struct Reply {
    header: Header,
    payload: Vec<u8>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        matches!(
            self.header.command,
            cmd::ACK_OK | cmd::PREPARE_DATA | cmd::DATA
        )
    }
}

/// The terminal's user table, cached for the life of one connection.
#[derive(Debug, Default)]
struct UserTable {
    /// Record width in bytes, unknown while the table is empty.
    width: Option<usize>,
    users: Vec<TerminalUser>,
}

impl UserTable {
    /// Slot for a user id: its current one, or the next free one.
    fn slot_for(&self, user_id: &str) -> Option<u16> {
        match self.users.iter().find(|u| u.user_id == user_id) {
            Some(existing) => Some(existing.uid),
            None => self
                .users
                .iter()
                .map(|u| u.uid)
                .max()
                .unwrap_or(0)
                .checked_add(1),
        }
    }

    fn upsert(&mut self, uid: u16, user: &UserProvision) {
        match self.users.iter_mut().find(|u| u.uid == uid) {
            Some(existing) => {
                existing.user_id = user.user_id.clone();
                existing.name = user.name.clone();
            }
            None => self.users.push(TerminalUser {
                uid,
                user_id: user.user_id.clone(),
                name: user.name.clone(),
            }),
        }
    }
}

struct ZkConnection {
    stream: TcpStream,
    address: String,
    session_id: u16,
    reply_id: u16,
    timeout: Duration,
    user_table: Option<UserTable>,
    open: bool,
}

/// Bounds an I/O future by the socket timeout and maps its failure.
async fn bounded<T>(
    limit: Duration,
    io: impl Future<Output = std::io::Result<T>>,
) -> SyncResult<T> {
    match tokio::time::timeout(limit, io).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SyncError::from_terminal_io(err, limit.as_secs())),
        Err(_) => Err(SyncError::Timeout(limit.as_secs())),
    }
}

fn rejected(command: &str, code: u16) -> SyncError {
    SyncError::TerminalRejected {
        command: command.to_string(),
        code,
    }
}

impl ZkConnection {
    /// Connects and, when the device asks for it, authenticates.
    async fn open(options: &ZkOptions) -> SyncResult<Self> {
        let target = (options.address.as_str(), options.port);
        let stream = bounded(options.timeout, TcpStream::connect(target)).await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "Could not disable Nagle");
        }

        let mut conn = ZkConnection {
            stream,
            address: options.address.clone(),
            session_id: 0,
            reply_id: protocol::INITIAL_REPLY_ID,
            timeout: options.timeout,
            user_table: None,
            open: true,
        };

        let mut reply = conn.send(cmd::CONNECT, &[]).await?;
        conn.session_id = reply.header.session_id;

        if reply.header.command == cmd::ACK_UNAUTH {
            debug!(address = %conn.address, "Terminal requires comm key");
            let key = protocol::make_commkey(
                options.password,
                conn.session_id,
                protocol::COMMKEY_TICKS,
            );
            reply = conn.send(cmd::AUTH, &key).await?;
            if !reply.is_ok() {
                return Err(rejected("AUTH", reply.header.command));
            }
        } else if !reply.is_ok() {
            return Err(rejected("CONNECT", reply.header.command));
        }

        info!(
            address = %conn.address,
            port = options.port,
            session_id = conn.session_id,
            "Connected to terminal"
        );
        Ok(conn)
    }

    // =========================================================================
    // Framing
    // =========================================================================

    /// Sends one command and reads its reply.
    async fn send(&mut self, command: u16, payload: &[u8]) -> SyncResult<Reply> {
        if !self.open {
            return Err(SyncError::Disconnected);
        }

        let (frame, sent_reply_id) =
            protocol::encode_command(command, self.session_id, self.reply_id, payload);
        self.reply_id = sent_reply_id;
        trace!(command, bytes = frame.len(), "Sending frame");

        let limit = self.timeout;
        if let Err(err) = bounded(limit, self.stream.write_all(&frame)).await {
            self.open = false;
            return Err(err);
        }

        let reply = self.read_frame().await?;
        self.reply_id = reply.header.reply_id;
        Ok(reply)
    }

    /// Sends a command the terminal must acknowledge.
    async fn expect_ok(&mut self, name: &str, command: u16, payload: &[u8]) -> SyncResult<Reply> {
        let reply = self.send(command, payload).await?;
        if !reply.is_ok() {
            return Err(rejected(name, reply.header.command));
        }
        Ok(reply)
    }

    /// Reads one complete frame.
    async fn read_frame(&mut self) -> SyncResult<Reply> {
        let limit = self.timeout;

        let mut top = [0u8; protocol::TCP_TOP_LEN];
        if let Err(err) = bounded(limit, self.stream.read_exact(&mut top)).await {
            self.open = false;
            return Err(err);
        }
        let len = protocol::parse_tcp_top(&top)?;

        let mut packet = vec![0u8; len];
        if let Err(err) = bounded(limit, self.stream.read_exact(&mut packet)).await {
            self.open = false;
            return Err(err);
        }

        let header = Header::decode(&packet)?;
        trace!(command = header.command, bytes = len, "Received frame");
        packet.drain(..protocol::HEADER_LEN);
        Ok(Reply {
            header,
            payload: packet,
        })
    }

    // =========================================================================
    // Bulk Reads
    // =========================================================================

    async fn read_sizes(&mut self) -> SyncResult<FreeSizes> {
        let reply = self
            .expect_ok("GET_FREE_SIZES", cmd::GET_FREE_SIZES, &[])
            .await?;
        protocol::parse_free_sizes(&reply.payload)
    }

    /// Reads a whole table through the device's transfer buffer.
    async fn read_with_buffer(&mut self, command: u16, fct: i32) -> SyncResult<Vec<u8>> {
        let request = protocol::buffer_request(command, fct, 0);
        let reply = self
            .expect_ok("PREPARE_BUFFER", cmd::PREPARE_BUFFER, &request)
            .await?;

        if reply.header.command == cmd::DATA {
            return Ok(reply.payload);
        }

        if reply.payload.len() < 5 {
            return Err(SyncError::ProtocolViolation(
                "buffer size missing from PREPARE_BUFFER reply".into(),
            ));
        }
        let size = u32::from_le_bytes([
            reply.payload[1],
            reply.payload[2],
            reply.payload[3],
            reply.payload[4],
        ]) as usize;

        let mut data = Vec::with_capacity(size);
        for (start, len) in protocol::chunk_plan(size) {
            let chunk = self.read_chunk(start, len).await?;
            data.extend_from_slice(&chunk);
        }

        self.expect_ok("FREE_DATA", cmd::FREE_DATA, &[]).await?;
        debug!(command, bytes = data.len(), "Buffered read complete");
        Ok(data)
    }

    async fn read_chunk(&mut self, start: usize, len: usize) -> SyncResult<Vec<u8>> {
        let request = protocol::chunk_request(start, len);
        let reply = self.send(cmd::READ_BUFFER, &request).await?;

        match reply.header.command {
            cmd::DATA => Ok(reply.payload),
            cmd::PREPARE_DATA => self.receive_prepared(&reply.payload).await,
            code => Err(rejected("READ_BUFFER", code)),
        }
    }

    /// Collects the DATA frames announced by a PREPARE_DATA reply.
    async fn receive_prepared(&mut self, announcement: &[u8]) -> SyncResult<Vec<u8>> {
        if announcement.len() < 4 {
            return Err(SyncError::ProtocolViolation(
                "PREPARE_DATA without a size".into(),
            ));
        }
        let size = u32::from_le_bytes([
            announcement[0],
            announcement[1],
            announcement[2],
            announcement[3],
        ]) as usize;

        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let frame = self.read_frame().await?;
            if frame.header.command != cmd::DATA {
                return Err(SyncError::ProtocolViolation(format!(
                    "expected DATA, got command {}",
                    frame.header.command
                )));
            }
            data.extend_from_slice(&frame.payload);
        }

        let ack = self.read_frame().await?;
        if ack.header.command != cmd::ACK_OK {
            return Err(SyncError::ProtocolViolation(format!(
                "expected ACK_OK after data, got command {}",
                ack.header.command
            )));
        }
        Ok(data)
    }

    /// Loads the user table once per connection.
    async fn user_table(&mut self) -> SyncResult<&mut UserTable> {
        if self.user_table.is_none() {
            let table = self.fetch_user_table().await?;
            self.user_table = Some(table);
        }
        Ok(self.user_table.get_or_insert_with(UserTable::default))
    }

    async fn fetch_user_table(&mut self) -> SyncResult<UserTable> {
        let sizes = self.read_sizes().await?;
        if sizes.users <= 0 {
            return Ok(UserTable::default());
        }

        let buffer = self
            .read_with_buffer(cmd::USERTEMP_RRQ, protocol::FCT_USER)
            .await?;
        let Some((total, records)) = protocol::split_table(&buffer) else {
            return Ok(UserTable::default());
        };

        let width = protocol::record_width(total, sizes.users);
        let users = protocol::decode_users(records, width)?;
        debug!(users = users.len(), width, "Read user table");
        Ok(UserTable {
            width: Some(width),
            users,
        })
    }
}

#[async_trait]
impl Terminal for ZkConnection {
    async fn set_capture_paused(&mut self, paused: bool) -> SyncResult<()> {
        if paused {
            self.expect_ok("DISABLE_DEVICE", cmd::DISABLE_DEVICE, &[]).await?;
        } else {
            self.expect_ok("ENABLE_DEVICE", cmd::ENABLE_DEVICE, &[]).await?;
        }
        Ok(())
    }

    async fn serial_number(&mut self) -> SyncResult<String> {
        let reply = self
            .expect_ok("OPTIONS_RRQ", cmd::OPTIONS_RRQ, b"~SerialNumber\0")
            .await?;
        Ok(protocol::parse_option_value(&reply.payload))
    }

    async fn event_log(&mut self) -> SyncResult<Vec<TerminalEvent>> {
        let sizes = self.read_sizes().await?;
        if sizes.records <= 0 {
            return Ok(Vec::new());
        }

        let buffer = self.read_with_buffer(cmd::ATTLOG_RRQ, 0).await?;
        let Some((total, records)) = protocol::split_table(&buffer) else {
            return Ok(Vec::new());
        };

        let width = protocol::record_width(total, sizes.records);
        let users = if width == protocol::ATT_RECORD_COMPACT {
            self.user_table().await?.users.clone()
        } else {
            Vec::new()
        };

        let events = protocol::decode_attendance(records, width, &users)?;
        debug!(events = events.len(), width, "Read attendance log");
        Ok(events)
    }

    async fn user_directory(&mut self) -> SyncResult<Vec<TerminalUser>> {
        Ok(self.user_table().await?.users.clone())
    }

    async fn provision_user(&mut self, user: &UserProvision) -> SyncResult<()> {
        let table = self.user_table().await?;
        let width = table.width.unwrap_or(protocol::USER_RECORD_EXTENDED);
        let uid = table.slot_for(&user.user_id).ok_or_else(|| SyncError::UnencodableUser {
            user_id: user.user_id.clone(),
            reason: "no free user slot".into(),
        })?;

        let payload = protocol::encode_user(user, uid, width)?;
        self.expect_ok("USER_WRQ", cmd::USER_WRQ, &payload).await?;
        self.expect_ok("REFRESH_DATA", cmd::REFRESH_DATA, &[]).await?;

        let table = self.user_table().await?;
        table.width.get_or_insert(width);
        table.upsert(uid, user);
        debug!(user_id = %user.user_id, uid, "User written to terminal");
        Ok(())
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        if !self.open {
            return Ok(());
        }

        let exit = self.send(cmd::EXIT, &[]).await;
        self.open = false;
        if let Err(err) = self.stream.shutdown().await {
            warn!(address = %self.address, error = %err, "Socket shutdown failed");
        }
        exit.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::tests::encode_time;
    use super::*;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};
    use tokio::net::{TcpListener, TcpStream};

    /// Builds a reply frame as the device would.
    fn reply(command: u16, session_id: u16, reply_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&command.to_le_bytes());
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&session_id.to_le_bytes());
        packet.extend_from_slice(&reply_id.to_le_bytes());
        packet.extend_from_slice(payload);

        let mut frame = vec![0x50, 0x50, 0x82, 0x7d];
        frame.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        frame.extend_from_slice(&packet);
        frame
    }

    fn sizes(users: i32, records: i32) -> Vec<u8> {
        let mut payload = vec![0u8; 80];
        payload[16..20].copy_from_slice(&users.to_le_bytes());
        payload[32..36].copy_from_slice(&records.to_le_bytes());
        payload
    }

    fn table(records: &[u8]) -> Vec<u8> {
        let mut buf = (records.len() as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(records);
        buf
    }

    /// A scripted device: answers commands, records what it received.
    struct FakeDevice {
        require_auth: bool,
        users: Vec<u8>,
        user_count: i32,
        attendance: Vec<u8>,
        attendance_count: i32,
        /// Serve the attendance table through READ_BUFFER + PREPARE_DATA.
        chunked_attendance: bool,
        received: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    }

    impl FakeDevice {
        async fn serve(self, listener: TcpListener) {
            let (mut socket, _) = listener.accept().await.unwrap();
            const SESSION: u16 = 0x1234;
            let mut pending_table: Vec<u8> = Vec::new();

            loop {
                let mut top = [0u8; 8];
                if socket.read_exact(&mut top).await.is_err() {
                    return;
                }
                let len = protocol::parse_tcp_top(&top).unwrap();
                let mut packet = vec![0u8; len];
                socket.read_exact(&mut packet).await.unwrap();
                let header = Header::decode(&packet).unwrap();
                let payload = packet[8..].to_vec();
                self.received
                    .lock()
                    .unwrap()
                    .push((header.command, payload.clone()));

                let r = header.reply_id;
                let out = match header.command {
                    cmd::CONNECT if self.require_auth => reply(cmd::ACK_UNAUTH, SESSION, r, &[]),
                    cmd::AUTH => {
                        let expected = protocol::make_commkey(1234, SESSION, 50);
                        let code = if payload == expected { cmd::ACK_OK } else { cmd::ACK_UNAUTH };
                        reply(code, SESSION, r, &[])
                    }
                    cmd::OPTIONS_RRQ => reply(cmd::ACK_OK, SESSION, r, b"~SerialNumber=CQZ7231\0"),
                    cmd::GET_FREE_SIZES => {
                        reply(cmd::ACK_OK, SESSION, r, &sizes(self.user_count, self.attendance_count))
                    }
                    cmd::PREPARE_BUFFER => {
                        let requested = u16::from_le_bytes([payload[1], payload[2]]);
                        let body = if requested == cmd::ATTLOG_RRQ {
                            table(&self.attendance)
                        } else {
                            table(&self.users)
                        };
                        if requested == cmd::ATTLOG_RRQ && self.chunked_attendance {
                            let mut announce = vec![0u8];
                            announce.extend_from_slice(&(body.len() as u32).to_le_bytes());
                            pending_table = body;
                            reply(cmd::ACK_OK, SESSION, r, &announce)
                        } else {
                            reply(cmd::DATA, SESSION, r, &body)
                        }
                    }
                    cmd::READ_BUFFER => {
                        let start = i32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                        let size = i32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
                        let chunk = pending_table[start..start + size].to_vec();
                        let mut out = reply(cmd::PREPARE_DATA, SESSION, r, &(size as u32).to_le_bytes());
                        let (first, second) = chunk.split_at(size / 2);
                        out.extend(reply(cmd::DATA, SESSION, r, first));
                        out.extend(reply(cmd::DATA, SESSION, r, second));
                        out.extend(reply(cmd::ACK_OK, SESSION, r, &[]));
                        out
                    }
                    cmd::USER_WRQ if payload.len() != 72 => reply(cmd::ACK_ERROR, SESSION, r, &[]),
                    cmd::EXIT => {
                        socket.write_all(&reply(cmd::ACK_OK, SESSION, r, &[])).await.unwrap();
                        return;
                    }
                    _ => reply(cmd::ACK_OK, SESSION, r, &[]),
                };
                socket.write_all(&out).await.unwrap();
            }
        }
    }

    async fn start(device: FakeDevice) -> (ZkConnector, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(device.serve(listener));

        let mut options = ZkOptions::new("127.0.0.1");
        options.port = port;
        options.password = 1234;
        options.timeout = Duration::from_secs(5);
        (ZkConnector::new(options), handle)
    }

    fn device() -> (FakeDevice, Arc<Mutex<Vec<(u16, Vec<u8>)>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let device = FakeDevice {
            require_auth: false,
            users: Vec::new(),
            user_count: 0,
            attendance: Vec::new(),
            attendance_count: 0,
            chunked_attendance: false,
            received: received.clone(),
        };
        (device, received)
    }

    fn extended_user(uid: u16, user_id: &str, name: &str) -> Vec<u8> {
        protocol::encode_user(&UserProvision::new(user_id, name), uid, 72).unwrap()
    }

    fn standard_punch(user_id: u32, minute: u32) -> Vec<u8> {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, minute, 0)
            .unwrap();
        let mut rec = Vec::new();
        rec.extend_from_slice(&user_id.to_le_bytes());
        rec.extend_from_slice(&encode_time(ts).to_le_bytes());
        rec.extend_from_slice(&[1, 0, 0, 0]);
        rec.extend_from_slice(&0u32.to_le_bytes());
        rec
    }

    #[tokio::test]
    async fn test_authenticated_session() {
        let (mut device, received) = device();
        device.require_auth = true;
        let (connector, server) = start(device).await;

        let mut terminal = connector.connect().await.unwrap();
        terminal.set_capture_paused(true).await.unwrap();
        assert_eq!(terminal.serial_number().await.unwrap(), "CQZ7231");
        terminal.set_capture_paused(false).await.unwrap();
        terminal.disconnect().await.unwrap();
        server.await.unwrap();

        let commands: Vec<u16> = received.lock().unwrap().iter().map(|(c, _)| *c).collect();
        assert_eq!(
            commands,
            vec![
                cmd::CONNECT,
                cmd::AUTH,
                cmd::DISABLE_DEVICE,
                cmd::OPTIONS_RRQ,
                cmd::ENABLE_DEVICE,
                cmd::EXIT
            ]
        );
    }

    #[tokio::test]
    async fn test_event_log_through_prepared_chunks() {
        let (mut device, _) = device();
        device.attendance = [standard_punch(1001, 0), standard_punch(1002, 5)].concat();
        device.attendance_count = 2;
        device.chunked_attendance = true;
        let (connector, server) = start(device).await;

        let mut terminal = connector.connect().await.unwrap();
        let events = terminal.event_log().await.unwrap();
        terminal.disconnect().await.unwrap();
        server.await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].user_id, "1001");
        assert_eq!(events[1].user_id, "1002");
        assert_eq!(events[1].timestamp.format("%H:%M").to_string(), "08:05");
    }

    #[tokio::test]
    async fn test_user_directory_and_provisioning() {
        let (mut device, received) = device();
        device.users = [extended_user(1, "1001", "Ana"), extended_user(4, "1004", "Bo")].concat();
        device.user_count = 2;
        let (connector, server) = start(device).await;

        let mut terminal = connector.connect().await.unwrap();
        let users = terminal.user_directory().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].name, "Bo");

        terminal
            .provision_user(&UserProvision::new("2001", "Cy"))
            .await
            .unwrap();
        terminal
            .provision_user(&UserProvision::new("1001", "Ana Lima"))
            .await
            .unwrap();
        terminal.disconnect().await.unwrap();
        server.await.unwrap();

        let writes: Vec<Vec<u8>> = received
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == cmd::USER_WRQ)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(writes.len(), 2);

        let written = protocol::decode_users(&writes.concat(), 72).unwrap();
        assert_eq!(written[0].uid, 5);
        assert_eq!(written[0].user_id, "2001");
        assert_eq!(written[1].uid, 1);
        assert_eq!(written[1].name, "Ana Lima");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut options = ZkOptions::new("127.0.0.1");
        options.port = port;
        let err = ZkConnector::new(options).connect().await.err().unwrap();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _): (TcpStream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut options = ZkOptions::new("127.0.0.1");
        options.port = port;
        options.timeout = Duration::from_millis(200);
        let err = ZkConnector::new(options).connect().await.err().unwrap();
        assert!(matches!(err, SyncError::Timeout(_)), "{err:?}");
        server.abort();
    }
}
