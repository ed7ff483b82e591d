//! Storage client.
//!
//! Every process that touches bytestreams keeps one dedicated connection to
//! the STORAGE process, separate from its general IPC endpoint, and runs
//! synchronous request/reply on it. Granted views are mapped directly from
//! the chunk files; the server only arbitrates offsets, so the data path
//! never crosses the socket.

use crate::error::{ComoError, ComoResult};
use crate::ipc::frame::{self, msg, FrameHeader, HEADER_SIZE};
use crate::ipc::peer::PeerId;
use crate::logging::{self, Logger};
use crate::serial::{from_bytes, to_bytes};
use crate::storage::proto::{
    err_code, CloseMsg, CommitMsg, ErrorReply, MapMsg, MapReply, OpenMsg, OpenMode, SeekDir,
    SeekMsg, SeekReply,
};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// Host page size; mapped views are aligned down to this.
const PAGE_SIZE: u64 = 4096;

/// How long a blocking map waits for the server. The server's own reader
/// watchdog fires first; this is the safety margin on top of it.
const BLOCKING_REPLY_TIMEOUT: Duration = Duration::from_secs(90);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Dedicated connection to the STORAGE process.
pub struct StorageConn {
    stream: TcpStream,
    me: PeerId,
    log: Logger,
}

impl StorageConn {
    /// Connects and performs the CONNECT handshake. Retries while the
    /// storage process is still starting up.
    pub fn connect(address: &str, me: PeerId, log: &Logger) -> ComoResult<StorageConn> {
        let addr = address
            .parse::<std::net::SocketAddr>()
            .map_err(|_| ComoError::Malformed("storage address"))?;

        let deadline = Instant::now() + Duration::from_secs(10);
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(err) => return Err(err.into()),
            }
        };
        stream.set_nodelay(true).ok();

        let mut conn = StorageConn {
            stream,
            me,
            log: log.new(logging::o!("unit" => "storage-client")),
        };
        conn.stream.write_all(&frame::connect_frame(&me))?;
        Ok(conn)
    }

    /// Opens a bytestream. `base` is the node's db-path, used to map chunk
    /// files locally once the server grants a view.
    pub fn open(
        &mut self,
        base: &Path,
        name: &str,
        mode: OpenMode,
        size_limit: u64,
    ) -> ComoResult<StorageFile> {
        let open = OpenMsg {
            name: name.to_string(),
            mode,
            size_limit,
        };
        let (mtype, payload) = self.request(msg::CS_OPEN, &to_bytes(&open)?, REPLY_TIMEOUT)?;
        let reply: crate::storage::proto::OpenReply = self.expect(mtype, msg::CS_OPEN_REPLY, &payload)?;

        logging::debug!(self.log, "bytestream opened";
                        "name" => name, "fd" => reply.fd, "ofs" => reply.ofs);

        Ok(StorageFile {
            fd: reply.fd,
            mode,
            dir: base.join(name),
            offset: reply.ofs,
            view: None,
        })
    }

    fn request(&mut self, mtype: u16, payload: &[u8], timeout: Duration) -> ComoResult<(u16, Vec<u8>)> {
        self.send(mtype, payload)?;
        self.read_reply(timeout)
    }

    fn send(&mut self, mtype: u16, payload: &[u8]) -> ComoResult<()> {
        let header = FrameHeader {
            mtype,
            sender: self.me,
            len: payload.len() as u32,
        };
        let mut head = [0u8; HEADER_SIZE];
        header.write(&mut head)?;

        self.stream.write_all(&head)?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    fn read_reply(&mut self, timeout: Duration) -> ComoResult<(u16, Vec<u8>)> {
        self.stream.set_read_timeout(Some(timeout))?;

        let mut head = [0u8; HEADER_SIZE];
        self.read_exact(&mut head)?;
        let header = FrameHeader::read(&head, false)?;

        let mut payload = vec![0u8; header.len as usize];
        self.read_exact(&mut payload)?;

        Ok((header.mtype, payload))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ComoResult<()> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(ComoError::Io(std::io::ErrorKind::TimedOut))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn expect<T: crate::serial::Serializable>(
        &self,
        mtype: u16,
        want: u16,
        payload: &[u8],
    ) -> ComoResult<T> {
        if mtype == msg::CS_ERROR {
            let err: ErrorReply = from_bytes(payload)?;
            return Err(storage_error(err.code));
        }
        if mtype != want {
            return Err(ComoError::Malformed("unexpected storage reply"));
        }
        from_bytes(payload)
    }
}

fn storage_error(code: u8) -> ComoError {
    match code {
        err_code::TIMEOUT => ComoError::Io(std::io::ErrorKind::TimedOut),
        err_code::WRITER_BUSY => ComoError::Overload,
        err_code::UNKNOWN_STREAM | err_code::NO_CHUNK => ComoError::Malformed("no such stream"),
        err_code::BAD_OFFSET => ComoError::Malformed("bad offset"),
        err_code::BAD_FD | err_code::NOT_WRITER => ComoError::Malformed("bad descriptor"),
        _ => ComoError::Io(std::io::ErrorKind::Other),
    }
}

enum ViewMap {
    Ro(Mmap),
    Rw(MmapMut),
}

struct View {
    /// Offset of the requested byte inside the page-aligned mapping.
    head: usize,
    len: usize,
    map: ViewMap,
}

/// An open bytestream handle. The current mapping is dropped implicitly by
/// the next `map`, `seek` or `close`, mirroring the one-active-region rule.
pub struct StorageFile {
    fd: u32,
    mode: OpenMode,
    dir: PathBuf,
    offset: u64,
    view: Option<View>,
}

impl StorageFile {
    /// Current absolute offset within the bytestream.
    #[inline]
    pub fn get_offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Requests a view of at least `sz` bytes at `ofs` and returns the
    /// granted bytes. The view never crosses a chunk boundary, so the
    /// result may be shorter than requested; an empty slice means
    /// end-of-stream for the requested offset.
    pub fn map(&mut self, conn: &mut StorageConn, ofs: u64, sz: usize) -> ComoResult<&[u8]> {
        let reply = self.map_request(conn, ofs, sz)?;
        if reply.len == 0 {
            self.view = None;
            return Ok(&[]);
        }

        self.install_view(ofs, reply, false)?;
        let view = self.view.as_ref().expect("view just installed");
        match &view.map {
            ViewMap::Ro(map) => Ok(&map[view.head..view.head + view.len]),
            ViewMap::Rw(_) => Err(ComoError::Fatal("reader view mapped writable")),
        }
    }

    /// Writer-side map: returns a writable view of exactly `sz` bytes at
    /// the tail for the records about to be stored.
    pub fn map_mut(&mut self, conn: &mut StorageConn, ofs: u64, sz: usize) -> ComoResult<&mut [u8]> {
        if self.mode != OpenMode::Writer {
            return Err(ComoError::Malformed("map_mut on reader"));
        }

        let reply = self.map_request(conn, ofs, sz)?;
        if (reply.len as usize) < sz {
            return Err(ComoError::Malformed("short writer grant"));
        }

        self.install_view(ofs, reply, true)?;
        let view = self.view.as_mut().expect("view just installed");
        let (head, len) = (view.head, sz);
        match &mut view.map {
            ViewMap::Rw(map) => Ok(&mut map[head..head + len]),
            ViewMap::Ro(_) => Err(ComoError::Fatal("writer view mapped read-only")),
        }
    }

    /// Declares bytes up to `ofs` durable and advances the offset. Blocked
    /// readers are woken by the server; there is no reply.
    pub fn commit(&mut self, conn: &mut StorageConn, ofs: u64) -> ComoResult<()> {
        if self.mode != OpenMode::Writer {
            return Err(ComoError::Malformed("commit on reader"));
        }

        if let Some(View { map: ViewMap::Rw(map), .. }) = &self.view {
            map.flush()?;
        }

        conn.send(
            msg::CS_COMMIT,
            &to_bytes(&CommitMsg { fd: self.fd, ofs })?,
        )?;
        self.offset = ofs;
        Ok(())
    }

    /// Jumps to the first byte of the next or previous chunk.
    pub fn seek(&mut self, conn: &mut StorageConn, dir: SeekDir) -> ComoResult<u64> {
        self.view = None;

        let (mtype, payload) = conn.request(
            msg::CS_SEEK,
            &to_bytes(&SeekMsg { fd: self.fd, dir })?,
            REPLY_TIMEOUT,
        )?;
        let reply: SeekReply = conn.expect(mtype, msg::CS_SEEK_REPLY, &payload)?;

        self.offset = reply.ofs;
        Ok(reply.ofs)
    }

    /// Releases the handle. A writer's `final_ofs` truncates the tail chunk
    /// at that byte.
    pub fn close(mut self, conn: &mut StorageConn, final_ofs: u64) -> ComoResult<()> {
        self.view = None;
        conn.send(
            msg::CS_CLOSE,
            &to_bytes(&CloseMsg {
                fd: self.fd,
                ofs: final_ofs,
            })?,
        )
    }

    fn map_request(&mut self, conn: &mut StorageConn, ofs: u64, sz: usize) -> ComoResult<MapReply> {
        let timeout = match self.mode {
            OpenMode::Reader => BLOCKING_REPLY_TIMEOUT,
            _ => REPLY_TIMEOUT,
        };

        let (mtype, payload) = conn.request(
            msg::CS_MAP,
            &to_bytes(&MapMsg {
                fd: self.fd,
                ofs,
                sz: sz as u32,
            })?,
            timeout,
        )?;
        conn.expect(mtype, msg::CS_MAP_REPLY, &payload)
    }

    /// Maps the granted range from the chunk file, aligning the file offset
    /// down to the page size.
    fn install_view(&mut self, ofs: u64, reply: MapReply, writable: bool) -> ComoResult<()> {
        let in_chunk = ofs - reply.chunk_start;
        let aligned = in_chunk & !(PAGE_SIZE - 1);
        let head = (in_chunk - aligned) as usize;
        let len = reply.len as usize;

        let path = self.dir.join(format!("{:016x}", reply.chunk_start));
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let map = if writable {
            let map = unsafe {
                MmapOptions::new()
                    .offset(aligned)
                    .len(head + len)
                    .map_mut(&file)?
            };
            ViewMap::Rw(map)
        } else {
            let map = unsafe {
                MmapOptions::new()
                    .offset(aligned)
                    .len(head + len)
                    .map(&file)?
            };
            ViewMap::Ro(map)
        };

        self.offset = ofs;
        self.view = Some(View { head, len, map });
        Ok(())
    }
}
