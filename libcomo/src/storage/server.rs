//! Bytestream server state machine.
//!
//! Transport-free: the STORAGE process feeds decoded protocol messages in
//! and ships the outcomes back over IPC. Keeping the state machine free of
//! sockets is what makes the blocking-reader and watchdog semantics
//! testable without a process pair.
//!
//! Client handles are small integers; chunks, streams and blocked readers
//! live in owned vectors, never in linked structures.

use crate::error::ComoResult;
use crate::logging::{self, Logger};
use crate::storage::proto::{err_code, MapReply, OpenMode, SeekDir};
use hashbrown::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default watchdog for blocked readers whose writer stalled.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(60);

pub type ClientId = u32;

/// Outcome of a map request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MapOutcome {
    /// The view is available; reply now.
    Granted(MapReply),
    /// Nothing to read yet; the reply is deferred until a commit or the
    /// watchdog fires.
    Blocked,
    /// End of stream for a non-blocking reader or a drained stream.
    Eof,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    start: u64,
    size: u64,
}

impl Chunk {
    #[inline]
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

struct Blocked {
    client: ClientId,
    ofs: u64,
    sz: u32,
    deadline: Instant,
}

struct Bytestream {
    name: String,
    dir: PathBuf,
    chunks: Vec<Chunk>,
    size_limit: u64,
    writer: Option<ClientId>,
    /// Highest byte the writer has declared durable.
    commit: u64,
    blocked: Vec<Blocked>,
}

impl Bytestream {
    /// Chunk cap: the writer seals and opens the next chunk rather than
    /// letting one file exceed half the stream size limit.
    #[inline]
    fn chunk_cap(&self) -> u64 {
        self.size_limit / 2
    }

    #[inline]
    fn tail(&self) -> u64 {
        self.chunks.last().map(|c| c.end()).unwrap_or(0)
    }

    fn chunk_path(&self, start: u64) -> PathBuf {
        self.dir.join(format!("{:016x}", start))
    }

    /// Index of the chunk containing `ofs`.
    fn chunk_at(&self, ofs: u64) -> Option<usize> {
        self.chunks
            .iter()
            .rposition(|c| c.start <= ofs && (ofs < c.end() || c.size == 0))
    }
}

struct Client {
    stream: usize,
    mode: OpenMode,
    pos: u64,
    /// Start offset of the chunk the client last mapped; seeks are
    /// relative to this chunk.
    chunk_start: u64,
}

pub struct StorageServer {
    base: PathBuf,
    streams: Vec<Bytestream>,
    by_name: HashMap<String, usize>,
    clients: Vec<Option<Client>>,
    watchdog: Duration,
    log: Logger,
}

impl StorageServer {
    pub fn new<P: AsRef<Path>>(base: P, watchdog: Duration, log: &Logger) -> StorageServer {
        StorageServer {
            base: base.as_ref().to_path_buf(),
            streams: Vec::new(),
            by_name: HashMap::new(),
            clients: Vec::new(),
            watchdog,
            log: log.new(logging::o!("unit" => "storage")),
        }
    }

    /// Opens a bytestream for a client. Returns the client handle and its
    /// initial absolute offset: the tail for writers, the first byte of the
    /// oldest chunk for readers.
    pub fn open(&mut self, name: &str, mode: OpenMode, size_limit: u64) -> Result<(ClientId, u64), u8> {
        let idx = self.load_stream(name, size_limit)?;

        if mode == OpenMode::Writer && self.streams[idx].writer.is_some() {
            logging::warn!(self.log, "second writer rejected"; "stream" => name);
            return Err(err_code::WRITER_BUSY);
        }

        let id = self.install_client(Client {
            stream: idx,
            mode,
            pos: 0,
            chunk_start: 0,
        });

        let stream = &mut self.streams[idx];
        let ofs = match mode {
            OpenMode::Writer => {
                stream.writer = Some(id);
                // Existing bytes are durable by definition; the writer
                // resumes at the tail.
                stream.commit = stream.tail();
                if stream.chunks.is_empty() {
                    if let Err(err) = fs::File::create(stream.chunk_path(0)) {
                        logging::warn!(self.log, "chunk create failed";
                                       "stream" => name, "error" => %err);
                        return Err(err_code::IO);
                    }
                    stream.chunks.push(Chunk { start: 0, size: 0 });
                }
                stream.tail()
            }
            _ => stream.chunks.first().map(|c| c.start).unwrap_or(0),
        };

        {
            let client = self.client_mut(id).expect("client just looked up");
            client.pos = ofs;
            client.chunk_start = ofs;
        }

        logging::debug!(self.log, "client opened bytestream";
                        "stream" => name, "client" => id,
                        "mode" => ?mode, "ofs" => ofs);
        Ok((id, ofs))
    }

    /// Handles a map request. For writers this extends (and possibly seals)
    /// the tail chunk; for readers it grants the committed range, blocks,
    /// or reports end-of-stream.
    pub fn map(&mut self, id: ClientId, ofs: u64, sz: u32, now: Instant) -> Result<MapOutcome, u8> {
        let (stream_idx, mode) = {
            let client = self.client(id).ok_or(err_code::BAD_FD)?;
            (client.stream, client.mode)
        };

        match mode {
            OpenMode::Writer => self.map_writer(stream_idx, ofs, sz),
            _ => {
                let outcome = self.map_reader(stream_idx, ofs, sz, mode, id, now)?;
                if let MapOutcome::Granted(reply) = outcome {
                    let client = self.client_mut(id).expect("client just looked up");
                    client.pos = ofs + reply.len as u64;
                    client.chunk_start = reply.chunk_start;
                }
                Ok(outcome)
            }
        }
    }

    fn map_writer(&mut self, stream_idx: usize, ofs: u64, sz: u32) -> Result<MapOutcome, u8> {
        let cap = self.streams[stream_idx].chunk_cap();
        let stream = &mut self.streams[stream_idx];

        let tail_start = stream.chunks.last().map(|c| c.start).unwrap_or(0);
        if ofs < tail_start || ofs < stream.commit {
            return Err(err_code::BAD_OFFSET);
        }

        // Seal the chunk and open the next when this view would push the
        // file past the cap. A view starting exactly at the chunk head is
        // exempt: a single oversized record cannot be split.
        let mut chunk_start = tail_start;
        if ofs > tail_start && ofs + sz as u64 - tail_start > cap {
            let sealed = stream.chunks.last_mut().expect("writer stream has chunks");
            sealed.size = ofs - sealed.start;
            let sealed_start = sealed.start;
            let sealed_size = sealed.size;
            let sealed_path = stream.chunk_path(sealed_start);

            if let Err(err) = truncate(&sealed_path, sealed_size) {
                logging::warn!(self.log, "chunk seal failed"; "error" => %err);
                return Err(err_code::IO);
            }

            if fs::File::create(stream.chunk_path(ofs)).is_err() {
                return Err(err_code::IO);
            }
            stream.chunks.push(Chunk { start: ofs, size: 0 });
            chunk_start = ofs;

            logging::debug!(self.log, "chunk sealed";
                            "stream" => &stream.name,
                            "sealed_at" => sealed_size,
                            "new_chunk" => chunk_start);
        }

        // Grow the backing file to cover the view.
        let needed = ofs + sz as u64 - chunk_start;
        let path = stream.chunk_path(chunk_start);
        if let Err(err) = grow(&path, needed) {
            logging::warn!(self.log, "chunk grow failed"; "error" => %err);
            return Err(err_code::IO);
        }

        let tail = stream.chunks.last_mut().expect("writer stream has chunks");
        if needed > tail.size {
            tail.size = needed;
        }

        Ok(MapOutcome::Granted(MapReply {
            chunk_start,
            len: sz,
        }))
    }

    fn map_reader(
        &mut self,
        stream_idx: usize,
        ofs: u64,
        sz: u32,
        mode: OpenMode,
        id: ClientId,
        now: Instant,
    ) -> Result<MapOutcome, u8> {
        let stream = &mut self.streams[stream_idx];

        let first = stream.chunks.first().map(|c| c.start).unwrap_or(0);
        if ofs < first {
            return Err(err_code::BAD_OFFSET);
        }

        if let Some(reply) = Self::granted_view(stream, ofs, sz) {
            return Ok(MapOutcome::Granted(reply));
        }

        // Nothing readable at this offset yet.
        if mode == OpenMode::Reader && stream.writer.is_some() {
            stream.blocked.push(Blocked {
                client: id,
                ofs,
                sz,
                deadline: now + self.watchdog,
            });
            logging::debug!(self.log, "reader blocked";
                            "stream" => &stream.name, "client" => id, "ofs" => ofs);
            return Ok(MapOutcome::Blocked);
        }

        Ok(MapOutcome::Eof)
    }

    /// Committed view available at `ofs`, truncated to the chunk end and to
    /// the commit point. `None` when no byte at `ofs` is committed.
    fn granted_view(stream: &Bytestream, ofs: u64, sz: u32) -> Option<MapReply> {
        if ofs >= stream.commit {
            return None;
        }

        let idx = stream.chunk_at(ofs)?;
        let chunk = &stream.chunks[idx];

        // The last chunk is readable up to the commit point only; sealed
        // chunks are immutable and readable in full.
        let chunk_end = if idx + 1 == stream.chunks.len() {
            stream.commit
        } else {
            chunk.end()
        };
        let avail_end = chunk_end.min(stream.commit);
        if avail_end <= ofs {
            return None;
        }

        let len = (avail_end - ofs).min(sz as u64) as u32;

        Some(MapReply {
            chunk_start: chunk.start,
            len,
        })
    }

    /// Writer commit: bytes `[previous_commit, ofs)` become durable and
    /// blocked readers whose request is now satisfiable are woken. Returns
    /// the reply for each woken reader.
    pub fn commit(&mut self, id: ClientId, ofs: u64) -> Result<Vec<(ClientId, MapReply)>, u8> {
        let stream_idx = {
            let client = self.client(id).ok_or(err_code::BAD_FD)?;
            if client.mode != OpenMode::Writer {
                return Err(err_code::NOT_WRITER);
            }
            client.stream
        };

        let stream = &mut self.streams[stream_idx];
        if stream.writer != Some(id) {
            return Err(err_code::NOT_WRITER);
        }
        if ofs < stream.commit {
            return Err(err_code::BAD_OFFSET);
        }

        stream.commit = ofs;
        logging::trace!(self.log, "commit"; "stream" => &stream.name, "ofs" => ofs);

        Ok(Self::wake_blocked(stream))
    }

    fn wake_blocked(stream: &mut Bytestream) -> Vec<(ClientId, MapReply)> {
        let mut woken = Vec::new();

        let mut idx = 0;
        while idx < stream.blocked.len() {
            let pending = &stream.blocked[idx];
            match Self::granted_view(stream, pending.ofs, pending.sz) {
                Some(reply) => {
                    let pending = stream.blocked.swap_remove(idx);
                    woken.push((pending.client, reply));
                }
                None => idx += 1,
            }
        }

        woken
    }

    /// Moves a reader to the first byte of the next or previous chunk and
    /// discards its current mapping position.
    pub fn seek(&mut self, id: ClientId, dir: SeekDir) -> Result<u64, u8> {
        let (stream_idx, chunk_start) = {
            let client = self.client(id).ok_or(err_code::BAD_FD)?;
            (client.stream, client.chunk_start)
        };

        let stream = &self.streams[stream_idx];
        let here = stream
            .chunks
            .iter()
            .position(|c| c.start == chunk_start)
            .ok_or(err_code::NO_CHUNK)?;

        let target = match dir {
            SeekDir::Next => here + 1,
            SeekDir::Prev => {
                if here == 0 {
                    return Err(err_code::NO_CHUNK);
                }
                here - 1
            }
        };

        let chunk = stream.chunks.get(target).ok_or(err_code::NO_CHUNK)?;
        let ofs = chunk.start;

        let client = self.client_mut(id).expect("client just looked up");
        client.pos = ofs;
        client.chunk_start = ofs;
        Ok(ofs)
    }

    /// Closes a client. A writer's `final_ofs` truncates the tail chunk and
    /// becomes the final commit point; readers still blocked on the stream
    /// are woken with whatever is durable (possibly nothing).
    pub fn close(&mut self, id: ClientId, final_ofs: u64) -> Vec<(ClientId, MapOutcome)> {
        let client = match self.clients.get_mut(id as usize).and_then(Option::take) {
            Some(client) => client,
            None => return Vec::new(),
        };

        let stream = &mut self.streams[client.stream];
        let mut woken = Vec::new();

        if client.mode == OpenMode::Writer && stream.writer == Some(id) {
            stream.writer = None;

            if let Some(tail_start) = stream.chunks.last().map(|c| c.start) {
                let tail_size = stream.chunks.last().map(|c| c.size).unwrap();
                let final_in_chunk = final_ofs.saturating_sub(tail_start);
                if final_in_chunk < tail_size {
                    let path = stream.chunk_path(tail_start);
                    if let Err(err) = truncate(&path, final_in_chunk) {
                        logging::warn!(self.log, "tail truncate failed"; "error" => %err);
                    }
                    stream.chunks.last_mut().unwrap().size = final_in_chunk;
                }
                // Bytes surviving the truncation are durable.
                let tail_end = stream.chunks.last().unwrap().end();
                stream.commit = stream.commit.max(tail_end);
            }

            // With the writer gone a blocked reader either gets data that
            // became durable or a clean end-of-stream.
            for (reader, reply) in Self::wake_blocked(stream) {
                woken.push((reader, MapOutcome::Granted(reply)));
            }
            for pending in stream.blocked.drain(..) {
                woken.push((pending.client, MapOutcome::Eof));
            }
        } else {
            stream.blocked.retain(|b| b.client != id);
        }

        logging::debug!(self.log, "client closed"; "client" => id);
        woken
    }

    /// Watchdog sweep: expires blocked readers whose deadline passed.
    /// Expired readers get an error reply, other clients are untouched.
    pub fn tick(&mut self, now: Instant) -> Vec<ClientId> {
        let mut expired = Vec::new();

        for stream in &mut self.streams {
            stream.blocked.retain(|pending| {
                if now >= pending.deadline {
                    expired.push(pending.client);
                    false
                } else {
                    true
                }
            });
        }

        if !expired.is_empty() {
            logging::warn!(self.log, "blocked readers timed out"; "count" => expired.len());
        }
        expired
    }

    /// Current commit offset of a stream, for the status service.
    pub fn stream_commit(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).map(|&idx| self.streams[idx].commit)
    }

    fn load_stream(&mut self, name: &str, size_limit: u64) -> Result<usize, u8> {
        if let Some(&idx) = self.by_name.get(name) {
            return Ok(idx);
        }

        let dir = self.base.join(name);
        if let Err(err) = fs::create_dir_all(&dir) {
            logging::warn!(self.log, "stream dir create failed";
                           "stream" => name, "error" => %err);
            return Err(err_code::IO);
        }

        let mut chunks = scan_chunks(&dir).map_err(|_| err_code::IO)?;
        chunks.sort_by_key(|c| c.start);

        let commit = chunks.last().map(|c| c.end()).unwrap_or(0);

        let idx = self.streams.len();
        self.streams.push(Bytestream {
            name: name.to_string(),
            dir,
            chunks,
            size_limit,
            writer: None,
            commit,
            blocked: Vec::new(),
        });
        self.by_name.insert(name.to_string(), idx);

        logging::info!(self.log, "bytestream loaded";
                       "stream" => name, "commit" => commit);
        Ok(idx)
    }

    fn install_client(&mut self, client: Client) -> ClientId {
        for (idx, slot) in self.clients.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(client);
                return idx as ClientId;
            }
        }
        self.clients.push(Some(client));
        (self.clients.len() - 1) as ClientId
    }

    fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id as usize).and_then(Option::as_ref)
    }

    fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id as usize).and_then(Option::as_mut)
    }
}

/// Parses the chunk files of a stream directory. Chunk names are 16 hex
/// digits of the start offset; anything else is ignored with a warning by
/// the caller.
fn scan_chunks(dir: &Path) -> ComoResult<Vec<Chunk>> {
    let mut chunks = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };

        if name.len() != 16 {
            continue;
        }
        let start = match u64::from_str_radix(name, 16) {
            Ok(start) => start,
            Err(_) => continue,
        };

        let size = entry.metadata()?.len();
        chunks.push(Chunk { start, size });
    }

    Ok(chunks)
}

fn grow(path: &Path, len: u64) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(())
}

fn truncate(path: &Path, len: u64) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn make_server(dir: &Path) -> StorageServer {
        StorageServer::new(dir, Duration::from_millis(50), &logging::discard())
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_writer_opens_at_tail_reader_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        let (writer, wofs) = server.open("traffic", OpenMode::Writer, 1 << 20).unwrap();
        assert_eq!(wofs, 0);

        let (reader, rofs) = server.open("traffic", OpenMode::Reader, 1 << 20).unwrap();
        assert_eq!(rofs, 0);
        assert_ne!(writer, reader);
    }

    #[test]
    fn test_single_writer_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        server.open("traffic", OpenMode::Writer, 1 << 20).unwrap();
        assert_eq!(
            server.open("traffic", OpenMode::Writer, 1 << 20).unwrap_err(),
            err_code::WRITER_BUSY
        );
    }

    #[test]
    fn test_blocked_reader_woken_by_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        let (writer, _) = server.open("s", OpenMode::Writer, 1 << 20).unwrap();
        let (reader, _) = server.open("s", OpenMode::Reader, 1 << 20).unwrap();

        // Empty stream: the blocking reader parks.
        let outcome = server.map(reader, 0, 4096, now()).unwrap();
        assert_eq!(outcome, MapOutcome::Blocked);

        // Writer maps and commits 8192 bytes.
        let grant = server.map(writer, 0, 8192, now()).unwrap();
        assert!(matches!(grant, MapOutcome::Granted(_)));
        let woken = server.commit(writer, 8192).unwrap();

        assert_eq!(woken.len(), 1);
        let (who, reply) = woken[0];
        assert_eq!(who, reader);
        assert_eq!(reply.chunk_start, 0);
        assert_eq!(reply.len, 4096);
    }

    #[test]
    fn test_no_reader_sees_uncommitted_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        let (writer, _) = server.open("s", OpenMode::Writer, 1 << 20).unwrap();
        let (reader, _) = server.open("s", OpenMode::ReaderNonBlock, 1 << 20).unwrap();

        server.map(writer, 0, 4096, now()).unwrap();
        // Mapped but not committed: reader sees end-of-stream.
        assert_eq!(server.map(reader, 0, 4096, now()).unwrap(), MapOutcome::Eof);

        server.commit(writer, 2048).unwrap();
        match server.map(reader, 0, 4096, now()).unwrap() {
            MapOutcome::Granted(reply) => assert_eq!(reply.len, 2048),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_chunk_seal_on_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        // streamsize 8192 -> chunk cap 4096.
        let (writer, _) = server.open("s", OpenMode::Writer, 8192).unwrap();

        // Two 2k views fill the first chunk exactly.
        server.map(writer, 0, 2048, now()).unwrap();
        server.commit(writer, 2048).unwrap();
        server.map(writer, 2048, 2048, now()).unwrap();
        server.commit(writer, 4096).unwrap();

        // The next view must land in a fresh chunk starting at 4096.
        match server.map(writer, 4096, 2048, now()).unwrap() {
            MapOutcome::Granted(reply) => assert_eq!(reply.chunk_start, 4096),
            other => panic!("unexpected outcome {:?}", other),
        }

        assert!(dir.path().join("s").join(format!("{:016x}", 0u64)).exists());
        assert!(dir.path().join("s").join(format!("{:016x}", 4096u64)).exists());

        // First chunk is sealed at the cap.
        let sealed = std::fs::metadata(dir.path().join("s").join(format!("{:016x}", 0u64)))
            .unwrap()
            .len();
        assert_eq!(sealed, 4096);
    }

    #[test]
    fn test_reader_view_truncated_at_chunk_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        let (writer, _) = server.open("s", OpenMode::Writer, 8192).unwrap();
        server.map(writer, 0, 4096, now()).unwrap();
        server.commit(writer, 4096).unwrap();
        server.map(writer, 4096, 1024, now()).unwrap();
        server.commit(writer, 5120).unwrap();

        let (reader, _) = server.open("s", OpenMode::Reader, 8192).unwrap();

        // Request spans the chunk boundary; granted view stops at it.
        match server.map(reader, 2048, 8192, now()).unwrap() {
            MapOutcome::Granted(reply) => {
                assert_eq!(reply.chunk_start, 0);
                assert_eq!(reply.len, 2048);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Seek lands on the next chunk's first byte.
        let ofs = server.seek(reader, SeekDir::Next).unwrap();
        assert_eq!(ofs, 4096);

        match server.map(reader, 4096, 8192, now()).unwrap() {
            MapOutcome::Granted(reply) => {
                assert_eq!(reply.chunk_start, 4096);
                assert_eq!(reply.len, 1024);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_watchdog_expires_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        server.open("s", OpenMode::Writer, 1 << 20).unwrap();
        let (reader, _) = server.open("s", OpenMode::Reader, 1 << 20).unwrap();
        let (other, _) = server.open("s", OpenMode::Reader, 1 << 20).unwrap();

        let start = now();
        assert_eq!(server.map(reader, 0, 64, start).unwrap(), MapOutcome::Blocked);

        // Before the deadline nothing expires.
        assert!(server.tick(start).is_empty());

        let expired = server.tick(start + Duration::from_millis(60));
        assert_eq!(expired, vec![reader]);

        // The other client is untouched and can still block.
        assert_eq!(server.map(other, 0, 64, now()).unwrap(), MapOutcome::Blocked);
    }

    #[test]
    fn test_writer_close_truncates_and_wakes() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(dir.path());

        let (writer, _) = server.open("s", OpenMode::Writer, 1 << 20).unwrap();
        let (reader, _) = server.open("s", OpenMode::Reader, 1 << 20).unwrap();

        server.map(writer, 0, 4096, now()).unwrap();
        server.commit(writer, 1000).unwrap();

        assert_eq!(server.map(reader, 1000, 64, now()).unwrap(), MapOutcome::Blocked);

        let woken = server.close(writer, 1000);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].0, reader);
        assert_eq!(woken[0].1, MapOutcome::Eof);

        // Tail chunk truncated at the final offset.
        let len = std::fs::metadata(dir.path().join("s").join(format!("{:016x}", 0u64)))
            .unwrap()
            .len();
        assert_eq!(len, 1000);
    }

    #[test]
    fn test_reopen_resumes_at_tail() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut server = make_server(dir.path());
            let (writer, _) = server.open("s", OpenMode::Writer, 1 << 20).unwrap();
            server.map(writer, 0, 512, now()).unwrap();
            server.commit(writer, 512).unwrap();
            server.close(writer, 512);
        }

        // A fresh server scans the directory and resumes at the tail.
        let mut server = make_server(dir.path());
        let (_, ofs) = server.open("s", OpenMode::Writer, 1 << 20).unwrap();
        assert_eq!(ofs, 512);

        let (reader, rofs) = server.open("s", OpenMode::Reader, 1 << 20).unwrap();
        assert_eq!(rofs, 0);
        match server.map(reader, 0, 4096, now()).unwrap() {
            MapOutcome::Granted(reply) => assert_eq!(reply.len, 512),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
