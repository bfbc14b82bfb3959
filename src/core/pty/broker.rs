//! Handle duplication broker
//!
//! A slave in another security session may not open the master's process to
//! copy its pipe handles. The broker is a trusted party that may: the slave
//! sends it one framed request per connection naming the master, itself and
//! the handles it wants, and gets back handle ids valid in its own table.
//!
//! Wire format, version 1, little endian:
//!
//! ```text
//! request:  "NTBK" version:u16 code:u16 len:u32 payload[len]
//! response: "NTBK" version:u16 status:u32 len:u32 payload[len]
//!
//! duplicate (code 1) payload:  master_pid:u32 client_pid:u32 count:u32
//!                              { handle:u64 access:u32 } * count
//! duplicate response payload:  count:u32 { handle:u64 } * count
//! ```

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::error::{Result, TtyError};
use crate::core::handles::{duplicate_handle, process_object_name, Access, HandleId, HandleTable};
use crate::core::process::{Pid, ProcessTable};
use crate::core::sync::Namespace;

pub const MAGIC: &[u8; 4] = b"NTBK";
pub const VERSION: u16 = 1;
pub const REQ_DUPLICATE: u16 = 1;

const REQUEST_HEADER_LEN: usize = 12;
const RESPONSE_HEADER_LEN: usize = 14;
/// Largest payload either side accepts.
const MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Denied = 1,
    BadRequest = 2,
    UnsupportedVersion = 3,
    NoSuchObject = 4,
}

impl Status {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Status::Ok),
            1 => Some(Status::Denied),
            2 => Some(Status::BadRequest),
            3 => Some(Status::UnsupportedVersion),
            4 => Some(Status::NoSuchObject),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u16,
    pub code: u16,
    pub len: u32,
}

impl RequestHeader {
    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut out = [0u8; REQUEST_HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.code.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> Option<Self> {
        if &buf[..4] != MAGIC {
            return None;
        }
        Some(Self {
            version: u16::from_le_bytes([buf[4], buf[5]]),
            code: u16::from_le_bytes([buf[6], buf[7]]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u16,
    pub status: u32,
    pub len: u32,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut out = [0u8; RESPONSE_HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..10].copy_from_slice(&self.status.to_le_bytes());
        out[10..14].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> Option<Self> {
        if &buf[..4] != MAGIC {
            return None;
        }
        Some(Self {
            version: u16::from_le_bytes([buf[4], buf[5]]),
            status: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            len: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }
}

/// Payload of a duplicate request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateRequest {
    pub master_pid: Pid,
    pub client_pid: Pid,
    pub handles: Vec<(HandleId, Access)>,
}

impl DuplicateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.handles.len() * 12);
        out.extend_from_slice(&self.master_pid.to_le_bytes());
        out.extend_from_slice(&self.client_pid.to_le_bytes());
        out.extend_from_slice(&(self.handles.len() as u32).to_le_bytes());
        for (id, access) in &self.handles {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&access.bits().to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut r = Reader(buf);
        let master_pid = r.u32()?;
        let client_pid = r.u32()?;
        let count = r.u32()? as usize;
        if count.checked_mul(12)? != r.0.len() {
            return None;
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let id = r.u64()?;
            let access = Access::from_bits(r.u32()?)?;
            handles.push((id, access));
        }
        Some(Self { master_pid, client_pid, handles })
    }
}

fn encode_ids(ids: &[HandleId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ids.len() * 8);
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

fn decode_ids(buf: &[u8]) -> Option<Vec<HandleId>> {
    let mut r = Reader(buf);
    let count = r.u32()? as usize;
    if count.checked_mul(8)? != r.0.len() {
        return None;
    }
    (0..count).map(|_| r.u64()).collect()
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.0.len() < N {
            return None;
        }
        let (head, rest) = self.0.split_at(N);
        self.0 = rest;
        head.try_into().ok()
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}

/// Byte stream to the broker.
pub trait BrokerStream: Read + Write + Send {}

impl<T: Read + Write + Send> BrokerStream for T {}

/// Opens connections to a broker.
pub trait Connector: Send + Sync {
    fn connect(&self) -> io::Result<Box<dyn BrokerStream>>;
}

/// The privileged side: sees every process's handle table.
pub struct BrokerServer {
    ns: Arc<Namespace>,
    procs: Arc<dyn ProcessTable>,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer").field("ns", &self.ns).finish()
    }
}

impl BrokerServer {
    pub fn new(ns: Arc<Namespace>, procs: Arc<dyn ProcessTable>) -> Self {
        Self { ns, procs }
    }

    /// Serve the one request a connection carries.
    pub fn handle(&self, stream: &mut dyn BrokerStream) -> Result<()> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        stream.read_exact(&mut header)?;
        let (status, payload) = match RequestHeader::decode(&header) {
            None => (Status::BadRequest, Vec::new()),
            Some(h) if h.version != VERSION => {
                warn!("broker: request version {} unsupported", h.version);
                (Status::UnsupportedVersion, Vec::new())
            }
            Some(h) if h.len as usize > MAX_PAYLOAD => (Status::BadRequest, Vec::new()),
            Some(h) => {
                let mut body = vec![0u8; h.len as usize];
                stream.read_exact(&mut body)?;
                self.dispatch(h.code, &body)
            }
        };
        let header = ResponseHeader {
            version: VERSION,
            status: status as u32,
            len: payload.len() as u32,
        };
        stream.write_all(&header.encode())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }

    fn dispatch(&self, code: u16, body: &[u8]) -> (Status, Vec<u8>) {
        match code {
            REQ_DUPLICATE => match DuplicateRequest::decode(body) {
                Some(req) => self.duplicate(&req),
                None => (Status::BadRequest, Vec::new()),
            },
            other => {
                debug!("broker: unknown request code {}", other);
                (Status::BadRequest, Vec::new())
            }
        }
    }

    fn duplicate(&self, req: &DuplicateRequest) -> (Status, Vec<u8>) {
        let open = |pid: Pid| self.ns.open::<HandleTable>(&process_object_name(pid));
        let (Some(master), Some(client)) = (open(req.master_pid), open(req.client_pid)) else {
            return (Status::NoSuchObject, Vec::new());
        };
        // acting for both sides is only allowed when they are the same user
        match (self.procs.uid(req.master_pid), self.procs.uid(req.client_pid)) {
            (Some(a), Some(b)) if a == b => {}
            _ => {
                warn!(
                    "broker: pid {} may not take handles of pid {}",
                    req.client_pid, req.master_pid
                );
                return (Status::Denied, Vec::new());
            }
        }

        let mut ids = Vec::with_capacity(req.handles.len());
        for &(id, access) in &req.handles {
            match duplicate_handle(&master, id, &client, access) {
                Ok(new) => ids.push(new),
                Err(e) => {
                    for new in ids {
                        let _ = client.close(new);
                    }
                    let status = match e {
                        TtyError::BadHandle => Status::NoSuchObject,
                        _ => Status::Denied,
                    };
                    return (status, Vec::new());
                }
            }
        }
        info!(
            "broker: duplicated {} handles from pid {} into pid {}",
            ids.len(),
            req.master_pid,
            req.client_pid
        );
        (Status::Ok, encode_ids(&ids))
    }
}

/// Client side, used by a slave.
pub struct BrokerClient {
    connector: Arc<dyn Connector>,
}

impl BrokerClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Ask for `handles` of `master_pid` to be copied into `client_pid`.
    pub fn duplicate(&self, master_pid: Pid, client_pid: Pid, handles: &[(HandleId, Access)]) -> Result<Vec<HandleId>> {
        let payload = DuplicateRequest {
            master_pid,
            client_pid,
            handles: handles.to_vec(),
        }
        .encode();
        let header = RequestHeader {
            version: VERSION,
            code: REQ_DUPLICATE,
            len: payload.len() as u32,
        };

        let mut stream = self
            .connector
            .connect()
            .map_err(|e| TtyError::access(format!("broker unreachable: {}", e)))?;
        stream.write_all(&header.encode())?;
        stream.write_all(&payload)?;
        stream.flush()?;

        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        stream.read_exact(&mut raw)?;
        let header = ResponseHeader::decode(&raw).ok_or_else(|| TtyError::io("broker: bad response magic"))?;
        if header.len as usize > MAX_PAYLOAD {
            return Err(TtyError::io("broker: oversized response"));
        }
        let mut body = vec![0u8; header.len as usize];
        stream.read_exact(&mut body)?;

        match Status::from_u32(header.status) {
            Some(Status::Ok) => {}
            Some(status) => return Err(TtyError::access(format!("broker refused: {:?}", status))),
            None => return Err(TtyError::io(format!("broker: unknown status {}", header.status))),
        }
        let ids = decode_ids(&body).ok_or_else(|| TtyError::io("broker: malformed reply"))?;
        if ids.len() != handles.len() {
            return Err(TtyError::io("broker: wrong number of handles"));
        }
        Ok(ids)
    }
}

/// Connector to a broker in this process.
pub struct LoopbackConnector {
    server: Arc<BrokerServer>,
}

impl LoopbackConnector {
    pub fn new(server: Arc<BrokerServer>) -> Self {
        Self { server }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> io::Result<Box<dyn BrokerStream>> {
        Ok(Box::new(LoopbackStream {
            server: self.server.clone(),
            request: Vec::new(),
            response: None,
        }))
    }
}

/// Collects the request; the first read runs the server on it.
struct LoopbackStream {
    server: Arc<BrokerServer>,
    request: Vec<u8>,
    response: Option<Cursor<Vec<u8>>>,
}

/// Request in, response out, as the server sees a connection.
struct Duplex {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for LoopbackStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response.is_none() {
            let mut duplex = Duplex {
                input: Cursor::new(std::mem::take(&mut self.request)),
                output: Vec::new(),
            };
            self.server
                .handle(&mut duplex)
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))?;
            self.response = Some(Cursor::new(duplex.output));
        }
        match self.response.as_mut() {
            Some(response) => response.read(buf),
            None => Ok(0),
        }
    }
}

impl Write for LoopbackStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.response.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "one request per connection"));
        }
        self.request.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipe::{pipe, PipeMode};
    use crate::core::handles::HandleObject;
    use crate::core::process::{LocalProcessTable, ProcessInfo};

    struct Rig {
        ns: Arc<Namespace>,
        master: Arc<HandleTable>,
        client: Arc<HandleTable>,
        reader: HandleId,
        client_pid: Pid,
        broker: BrokerClient,
    }

    fn rig(client_uid: u32) -> Rig {
        let ns = Arc::new(Namespace::new());
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(1).user(1000).logon_session(0));
        procs.insert(ProcessInfo::new(50).user(client_uid).logon_session(1));
        let master = HandleTable::register(&ns, 1).unwrap();
        let client = HandleTable::register(&ns, 50).unwrap();
        let (r, w) = pipe("broker.test", 64, PipeMode::Byte);
        let reader = master.insert(HandleObject::PipeRead(r), Access::empty());
        master.insert(HandleObject::PipeWrite(w), Access::empty());
        let server = Arc::new(BrokerServer::new(ns.clone(), procs));
        let broker = BrokerClient::new(Arc::new(LoopbackConnector::new(server)));
        Rig { ns, master, client, reader, client_pid: 50, broker }
    }

    #[test]
    fn test_duplicate_through_broker() {
        let r = rig(1000);
        let ids = r
            .broker
            .duplicate(1, r.client_pid, &[(r.reader, Access::GENERIC_READ)])
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(r.client.pipe_reader(ids[0]).is_ok());
        assert_eq!(r.master.len(), 2);
        assert!(r.ns.exists(&process_object_name(50)));
    }

    #[test]
    fn test_other_user_is_denied() {
        let r = rig(2000);
        let err = r
            .broker
            .duplicate(1, r.client_pid, &[(r.reader, Access::GENERIC_READ)])
            .unwrap_err();
        assert!(matches!(err, TtyError::AccessDenied(_)));
        assert!(r.client.is_empty());
    }

    #[test]
    fn test_unknown_handle_leaves_nothing_behind() {
        let r = rig(1000);
        let err = r
            .broker
            .duplicate(1, r.client_pid, &[(r.reader, Access::GENERIC_READ), (0xdead, Access::GENERIC_READ)])
            .unwrap_err();
        assert!(matches!(err, TtyError::AccessDenied(_)));
        assert!(r.client.is_empty());
    }

    #[test]
    fn test_wrong_version_is_refused() {
        let r = rig(1000);
        let server = BrokerServer::new(r.ns.clone(), Arc::new(LocalProcessTable::new()));
        let header = RequestHeader { version: 9, code: REQ_DUPLICATE, len: 0 };
        let mut duplex = Duplex { input: Cursor::new(header.encode().to_vec()), output: Vec::new() };
        server.handle(&mut duplex).unwrap();
        let raw: [u8; RESPONSE_HEADER_LEN] = duplex.output[..RESPONSE_HEADER_LEN].try_into().unwrap();
        let resp = ResponseHeader::decode(&raw).unwrap();
        assert_eq!(resp.status, Status::UnsupportedVersion as u32);
        assert_eq!(resp.len, 0);
    }

    #[test]
    fn test_truncated_payload_is_bad_request() {
        assert!(DuplicateRequest::decode(&[1, 0, 0, 0, 2, 0, 0, 0, 5, 0, 0, 0]).is_none());
        assert!(decode_ids(&[2, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
