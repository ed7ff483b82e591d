//! IPC face of the storage server.
//!
//! Binds a `StorageServer` to an `Endpoint`: decodes client requests,
//! routes deferred replies for blocked readers, and runs the watchdog
//! sweep. The STORAGE process main loop is a thin shell around `run_once`.

use crate::error::{ComoError, ComoResult, Outcome};
use crate::ipc::{msg, Endpoint, Envelope, Mailbox, PeerId, PeerSlot};
use crate::logging::{self, Logger};
use crate::serial::{from_bytes, to_bytes};
use crate::storage::proto::{
    err_code, CloseMsg, CommitMsg, ErrorReply, MapMsg, MapReply, OpenMsg, OpenReply, SeekMsg,
    SeekReply,
};
use crate::storage::server::{ClientId, MapOutcome, StorageServer};
use hashbrown::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

struct ServiceCtx {
    server: StorageServer,
    /// Which peer owns each storage client handle; blocked-map replies and
    /// watchdog errors are routed through this.
    owners: HashMap<ClientId, PeerSlot>,
    exiting: bool,
    log: Logger,
}

fn handle_exit(
    ctx: &mut ServiceCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.exiting = true;
    Ok(Outcome::Ok)
}

pub struct StorageService {
    endpoint: Endpoint<ServiceCtx>,
    ctx: ServiceCtx,
    local_addr: std::net::SocketAddr,
}

impl StorageService {
    pub fn new<P: AsRef<Path>>(
        base: P,
        address: &str,
        watchdog: Duration,
        log: &Logger,
    ) -> ComoResult<StorageService> {
        let mut endpoint = Endpoint::new(PeerId::storage(), log)?;
        let local_addr = endpoint.listen(address)?;

        endpoint.register(msg::CS_OPEN, handle_open);
        endpoint.register(msg::CS_MAP, handle_map);
        endpoint.register(msg::CS_COMMIT, handle_commit);
        endpoint.register(msg::CS_SEEK, handle_seek);
        endpoint.register(msg::CS_CLOSE, handle_close);
        endpoint.register(msg::EXIT, handle_exit);

        Ok(StorageService {
            endpoint,
            ctx: ServiceCtx {
                server: StorageServer::new(base, watchdog, log),
                owners: HashMap::new(),
                exiting: false,
                log: log.new(logging::o!("unit" => "storage-service")),
            },
            local_addr,
        })
    }

    /// The bound address, for handing to child processes.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Connects to the supervisor and reports startup completion.
    pub fn sync_with(&mut self, address: &str) -> ComoResult<()> {
        let slot = self.endpoint.connect(address, PeerId::supervisor())?;
        self.endpoint.send(slot, msg::SYNC, &[])
    }

    /// True once an EXIT message arrived.
    pub fn exiting(&self) -> bool {
        self.ctx.exiting
    }

    /// One cooperative iteration: dispatch requests, then sweep the
    /// watchdog and deliver timeout errors to expired blocked readers.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> ComoResult<()> {
        self.endpoint.poll_once(&mut self.ctx, timeout)?;

        for client in self.ctx.server.tick(Instant::now()) {
            if let Some(&slot) = self.ctx.owners.get(&client) {
                let reply = to_bytes(&ErrorReply {
                    code: err_code::TIMEOUT,
                })?;
                if self.endpoint.send(slot, msg::CS_ERROR, &reply).is_err() {
                    self.endpoint.teardown(slot);
                }
            }
        }

        Ok(())
    }
}

fn reply_error(mail: &mut Mailbox, slot: PeerSlot, code: u8) -> ComoResult<Outcome> {
    mail.send(
        slot,
        msg::CS_ERROR,
        to_bytes(&ErrorReply { code })?,
    );
    Ok(Outcome::Ok)
}

fn handle_open(
    ctx: &mut ServiceCtx,
    mail: &mut Mailbox,
    env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let open: OpenMsg = from_bytes(payload)?;

    match ctx.server.open(&open.name, open.mode, open.size_limit) {
        Ok((fd, ofs)) => {
            ctx.owners.insert(fd, env.slot);
            mail.send(
                env.slot,
                msg::CS_OPEN_REPLY,
                to_bytes(&OpenReply { fd, ofs })?,
            );
            Ok(Outcome::Ok)
        }
        Err(code) => reply_error(mail, env.slot, code),
    }
}

fn handle_map(
    ctx: &mut ServiceCtx,
    mail: &mut Mailbox,
    env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let map: MapMsg = from_bytes(payload)?;

    match ctx.server.map(map.fd, map.ofs, map.sz, Instant::now()) {
        Ok(MapOutcome::Granted(reply)) => {
            mail.send(env.slot, msg::CS_MAP_REPLY, to_bytes(&reply)?);
            Ok(Outcome::Ok)
        }
        // The reply is deferred to a commit, writer close, or watchdog.
        Ok(MapOutcome::Blocked) => Ok(Outcome::Ok),
        Ok(MapOutcome::Eof) => {
            mail.send(
                env.slot,
                msg::CS_MAP_REPLY,
                to_bytes(&MapReply {
                    chunk_start: map.ofs,
                    len: 0,
                })?,
            );
            Ok(Outcome::Ok)
        }
        Err(code) => reply_error(mail, env.slot, code),
    }
}

fn handle_commit(
    ctx: &mut ServiceCtx,
    mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let commit: CommitMsg = from_bytes(payload)?;

    match ctx.server.commit(commit.fd, commit.ofs) {
        Ok(woken) => {
            for (client, reply) in woken {
                match ctx.owners.get(&client) {
                    Some(&slot) => mail.send(slot, msg::CS_MAP_REPLY, to_bytes(&reply)?),
                    None => logging::warn!(ctx.log, "woken client has no owner";
                                           "client" => client),
                }
            }
            Ok(Outcome::Ok)
        }
        // Commit carries no reply channel; a bad commit only loses the peer.
        Err(code) => {
            logging::warn!(ctx.log, "commit rejected";
                           "fd" => commit.fd, "code" => code);
            Ok(Outcome::Err)
        }
    }
}

fn handle_seek(
    ctx: &mut ServiceCtx,
    mail: &mut Mailbox,
    env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let seek: SeekMsg = from_bytes(payload)?;

    match ctx.server.seek(seek.fd, seek.dir) {
        Ok(ofs) => {
            mail.send(env.slot, msg::CS_SEEK_REPLY, to_bytes(&SeekReply { ofs })?);
            Ok(Outcome::Ok)
        }
        Err(code) => reply_error(mail, env.slot, code),
    }
}

fn handle_close(
    ctx: &mut ServiceCtx,
    mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let close: CloseMsg = from_bytes(payload)?;

    for (client, outcome) in ctx.server.close(close.fd, close.ofs) {
        let slot = match ctx.owners.get(&client) {
            Some(&slot) => slot,
            None => continue,
        };
        let reply = match outcome {
            MapOutcome::Granted(reply) => reply,
            _ => MapReply {
                chunk_start: 0,
                len: 0,
            },
        };
        if let Ok(bytes) = to_bytes(&reply) {
            mail.send(slot, msg::CS_MAP_REPLY, bytes);
        }
    }

    ctx.owners.remove(&close.fd);
    Ok(Outcome::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::storage::client::StorageConn;
    use crate::storage::proto::{OpenMode, SeekDir};
    use crate::storage::record;
    use crate::time::ts_from_secs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Runs the service loop on a helper thread for the duration of a test.
    /// The production storage process runs the same loop single-threaded.
    fn spawn_service(dir: &Path, watchdog: Duration) -> (String, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let mut service =
            StorageService::new(dir, "127.0.0.1:0", watchdog, &logging::discard()).unwrap();
        let addr = service.local_addr().to_string();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Relaxed) {
                service.run_once(Some(Duration::from_millis(5))).unwrap();
            }
        });

        (addr, stop, handle)
    }

    fn write_records(
        conn: &mut StorageConn,
        file: &mut crate::storage::client::StorageFile,
        count: u32,
    ) {
        for i in 0..count {
            let rec = record::store(ts_from_secs(i as u64), &TestRec { val: i }).unwrap();
            let ofs = file.get_offset();
            let view = file.map_mut(conn, ofs, rec.len()).unwrap();
            view.copy_from_slice(&rec);
            file.commit(conn, ofs + rec.len() as u64).unwrap();
        }
    }

    struct TestRec {
        val: u32,
    }

    impl crate::serial::Serializable for TestRec {
        fn serialize<W: crate::serial::SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
            use byteorder::WriteBytesExt;
            stream.write_u32::<byteorder::BigEndian>(self.val)?;
            Ok(())
        }

        fn deserialize<R: crate::serial::SizedRead>(stream: &mut R) -> ComoResult<Self> {
            use byteorder::ReadBytesExt;
            Ok(TestRec {
                val: stream.read_u32::<byteorder::BigEndian>()?,
            })
        }

        fn exposed_len(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_write_then_read_through_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, stop, handle) = spawn_service(dir.path(), Duration::from_secs(60));

        let log = logging::discard();
        let mut wconn = StorageConn::connect(&addr, PeerId::export(), &log).unwrap();
        let mut file = wconn
            .open(dir.path(), "traffic", OpenMode::Writer, 1 << 20)
            .unwrap();

        write_records(&mut wconn, &mut file, 5);
        let tail = file.get_offset();
        file.close(&mut wconn, tail).unwrap();

        // Fresh reader connection walks the records back.
        let mut rconn = StorageConn::connect(&addr, PeerId::query(), &log).unwrap();
        let mut reader = rconn
            .open(dir.path(), "traffic", OpenMode::ReaderNonBlock, 1 << 20)
            .unwrap();

        let mut ofs = reader.get_offset();
        let mut seen = Vec::new();
        loop {
            let bytes = reader.map(&mut rconn, ofs, 4096).unwrap().to_vec();
            if bytes.is_empty() {
                break;
            }
            let mut at = 0;
            while at + record::RECORD_HEADER <= bytes.len() {
                let (size, ts) = record::load(&bytes[at..]).unwrap();
                seen.push(crate::time::ts_secs(ts) as u32);
                at += size as usize;
            }
            ofs += at as u64;
        }

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_reader_wakes_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, stop, handle) = spawn_service(dir.path(), Duration::from_secs(60));
        let log = logging::discard();

        // Writer thread commits after a delay; the blocking reader in this
        // thread returns only once the commit lands.
        let waddr = addr.clone();
        let wdir = dir.path().to_path_buf();
        let writer = std::thread::spawn(move || {
            let log = logging::discard();
            let mut conn = StorageConn::connect(&waddr, PeerId::export(), &log).unwrap();
            let mut file = conn.open(&wdir, "s", OpenMode::Writer, 1 << 20).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            let view = file.map_mut(&mut conn, 0, 8192).unwrap();
            for (i, byte) in view.iter_mut().enumerate() {
                *byte = i as u8;
            }
            file.commit(&mut conn, 8192).unwrap();
            file.close(&mut conn, 8192).unwrap();
        });

        // Give the writer time to open so a writer exists to block on.
        std::thread::sleep(Duration::from_millis(30));

        let mut rconn = StorageConn::connect(&addr, PeerId::query(), &log).unwrap();
        let mut reader = rconn
            .open(dir.path(), "s", OpenMode::Reader, 1 << 20)
            .unwrap();

        let bytes = reader.map(&mut rconn, 0, 4096).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(bytes[1], 1);

        writer.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_seek_next_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, stop, handle) = spawn_service(dir.path(), Duration::from_secs(60));
        let log = logging::discard();

        let mut conn = StorageConn::connect(&addr, PeerId::export(), &log).unwrap();
        // streamsize 8192: the second 3k view seals chunk one.
        let mut file = conn.open(dir.path(), "s", OpenMode::Writer, 8192).unwrap();

        let view = file.map_mut(&mut conn, 0, 3000).unwrap();
        view.fill(1);
        file.commit(&mut conn, 3000).unwrap();
        let view = file.map_mut(&mut conn, 3000, 3000).unwrap();
        view.fill(2);
        file.commit(&mut conn, 6000).unwrap();
        file.close(&mut conn, 6000).unwrap();

        let mut rconn = StorageConn::connect(&addr, PeerId::query(), &log).unwrap();
        let mut reader = rconn
            .open(dir.path(), "s", OpenMode::ReaderNonBlock, 8192)
            .unwrap();

        let bytes = reader.map(&mut rconn, 0, 8192).unwrap();
        assert_eq!(bytes.len(), 3000);

        let ofs = reader.seek(&mut rconn, SeekDir::Next).unwrap();
        assert_eq!(ofs, 3000);
        let bytes = reader.map(&mut rconn, ofs, 8192).unwrap();
        assert_eq!(bytes.len(), 3000);
        assert!(bytes.iter().all(|&b| b == 2));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
