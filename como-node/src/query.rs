//! QUERY process.
//!
//! One worker per accepted connection, one request per connection. A module
//! query walks the module's bytestream through `load`, filters by time and
//! renders through `print`; with `source=` the worker instead replays a
//! source module's records into synthetic packets and drives them through
//! the queried module's full pipeline before printing.

use crate::config::NodeConfig;
use chrono::NaiveDateTime;
use libcomo::error::{ComoError, ComoResult, Outcome};
use libcomo::export::MemSink;
use libcomo::filter::Filter;
use libcomo::ipc::{msg, Endpoint, Envelope, Mailbox, PeerId};
use libcomo::logging::{self, Logger};
use libcomo::mem::{Pool, Region};
use libcomo::module::{ModuleAddMsg, ModuleDef, ArgMap, QueryRunner};
use libcomo::serial::from_bytes;
use libcomo::storage::record;
use libcomo::storage::{OpenMode, StorageConn};
use libcomo::time::{timestamp_secs, ts_secs};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

const SCAN_CHUNK: usize = 65536;

struct QModule {
    def: ModuleDef,
    config: Vec<u8>,
    runner: Box<dyn QueryRunner>,
}

pub struct QueryCtx {
    mods: Vec<QModule>,
    node_name: String,
    node_location: String,
    started: u64,
    exiting: bool,
    log: Logger,
}

fn handle_module_add(
    ctx: &mut QueryCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let add: ModuleAddMsg = from_bytes(payload)?;

    let handle = match como_modules::lookup(&add.def.kind) {
        Some(handle) => handle,
        None => return Ok(Outcome::Ok),
    };

    let runner = match (handle.query)(add.def.clone(), &add.config) {
        Ok(runner) => runner,
        Err(err) => {
            logging::warn!(ctx.log, "module attach failed";
                           "module" => &add.def.name, "error" => ?err);
            return Ok(Outcome::Ok);
        }
    };
    ctx.mods.push(QModule {
        def: add.def,
        config: add.config,
        runner,
    });
    Ok(Outcome::Ok)
}

fn handle_module_del(
    ctx: &mut QueryCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let name = String::from_utf8_lossy(payload).to_string();
    ctx.mods.retain(|m| m.def.name != name);
    Ok(Outcome::Ok)
}

fn handle_ignore(
    _ctx: &mut QueryCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    Ok(Outcome::Ok)
}

fn handle_exit(
    ctx: &mut QueryCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.exiting = true;
    Ok(Outcome::Ok)
}

pub fn run(config: &NodeConfig, log: &Logger) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "query"));

    let mut endpoint: Endpoint<QueryCtx> = Endpoint::new(PeerId::query(), &log)?;
    endpoint.register(msg::MODULE_ADD, handle_module_add);
    endpoint.register(msg::MODULE_DEL, handle_module_del);
    endpoint.register(msg::MODULE_START, handle_ignore);
    endpoint.register(msg::MODULE_STATUS, handle_ignore);
    endpoint.register(msg::EXIT, handle_exit);

    let sup_slot = endpoint.connect(&config.supervisor_addr(), PeerId::supervisor())?;

    let mut conn = StorageConn::connect(&config.storage_addr(), PeerId::query(), &log)?;

    let listener = TcpListener::bind(("0.0.0.0", config.query_port))?;
    listener.set_nonblocking(true)?;

    let mut ctx = QueryCtx {
        mods: Vec::new(),
        node_name: config.name.clone(),
        node_location: config.location.clone(),
        started: timestamp_secs(),
        exiting: false,
        log: log.clone(),
    };

    endpoint.send(sup_slot, msg::SYNC, &[])?;
    logging::info!(log, "query ready"; "port" => config.query_port);

    loop {
        endpoint.poll_once(&mut ctx, Some(Duration::from_millis(10)))?;
        if ctx.exiting {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                logging::debug!(log, "query connection"; "from" => %addr);
                if let Err(err) = serve(&mut ctx, &mut conn, config, stream) {
                    logging::warn!(log, "query worker failed"; "error" => ?err);
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// One request per connection.
fn serve(
    ctx: &mut QueryCtx,
    conn: &mut StorageConn,
    config: &NodeConfig,
    mut stream: TcpStream,
) -> ComoResult<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut raw = [0u8; 4096];
    let mut len = 0;
    loop {
        let count = match stream.read(&mut raw[len..]) {
            Ok(0) => break,
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(err.into()),
        };
        len += count;
        if raw[..len].windows(2).any(|w| w == b"\n\n")
            || raw[..len].windows(4).any(|w| w == b"\r\n\r\n")
            || len == raw.len()
        {
            break;
        }
    }

    let request = String::from_utf8_lossy(&raw[..len]).to_string();
    let (status, ctype, body) = dispatch(ctx, conn, config, &request);

    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    write!(
        stream,
        "HTTP/1.0 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        ctype,
        body.len()
    )?;
    stream.write_all(&body)?;
    Ok(())
}

fn dispatch(
    ctx: &mut QueryCtx,
    conn: &mut StorageConn,
    config: &NodeConfig,
    request: &str,
) -> (u16, String, Vec<u8>) {
    let line = match request.lines().next() {
        Some(line) => line,
        None => return error_reply(400, "empty request"),
    };

    let mut words = line.split_whitespace();
    let method = words.next().unwrap_or("");
    let uri = words.next().unwrap_or("");
    let version = words.next().unwrap_or("");

    if method != "GET" {
        return error_reply(405, "only GET is supported");
    }
    if !version.starts_with("HTTP/1.") || uri.is_empty() {
        return error_reply(400, "malformed request line");
    }

    let (path, query) = match uri.find('?') {
        Some(at) => (&uri[..at], &uri[at + 1..]),
        None => (uri, ""),
    };
    let params = parse_params(query);

    match path.trim_matches('/') {
        "status" => status_reply(ctx),
        path if path.starts_with("services/") => match &path["services/".len()..] {
            "status" => status_reply(ctx),
            _ => error_reply(404, "unknown service"),
        },
        module_path => {
            let name = params
                .get("module")
                .cloned()
                .unwrap_or_else(|| module_path.to_string());
            module_query(ctx, conn, config, &name, &params)
        }
    }
}

fn parse_params(query: &str) -> ArgMap {
    let mut params = ArgMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(at) => params.insert(pair[..at].to_string(), pair[at + 1..].to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    params
}

fn error_reply(status: u16, reason: &str) -> (u16, String, Vec<u8>) {
    (
        status,
        "text/plain".to_string(),
        format!("{}\n", reason).into_bytes(),
    )
}

fn content_type(format: &str) -> String {
    match format {
        "html" => "text/html".to_string(),
        "json" => "application/json".to_string(),
        "como" | "raw" => "application/octet-stream".to_string(),
        _ => "text/plain".to_string(),
    }
}

fn status_reply(ctx: &QueryCtx) -> (u16, String, Vec<u8>) {
    let mut body = String::new();
    body.push_str(&format!("Node: {}\n", ctx.node_name));
    body.push_str(&format!("Location: {}\n", ctx.node_location));
    body.push_str(&format!("Start: {}\n", ctx.started));
    body.push_str(&format!("Current: {}\n", timestamp_secs()));
    for module in &ctx.mods {
        body.push_str(&format!(
            "Module: {} | filter: {} | output: {} | formats: {}\n",
            module.def.name,
            module.def.filter,
            module.def.output,
            module.runner.formats().join(" ")
        ));
    }
    (200, "text/plain".to_string(), body.into_bytes())
}

fn module_query(
    ctx: &mut QueryCtx,
    conn: &mut StorageConn,
    config: &NodeConfig,
    name: &str,
    params: &ArgMap,
) -> (u16, String, Vec<u8>) {
    let now = timestamp_secs();

    let idx = match ctx.mods.iter().position(|m| m.def.name == name) {
        Some(idx) => idx,
        None => return error_reply(404, "unknown module"),
    };

    // Format must be one the module declared.
    let formats = ctx.mods[idx].runner.formats();
    let format = params
        .get("format")
        .map(String::as_str)
        .unwrap_or(formats[0])
        .to_string();
    if !formats.contains(&format.as_str()) {
        return error_reply(400, "format not supported by module");
    }

    let range = match time_range(params, now) {
        Ok(range) => range,
        Err(_) => return error_reply(400, "malformed time bounds"),
    };

    let blocking = params.get("wait").map(String::as_str) != Some("no");

    let result = match params.get("source") {
        Some(source) => {
            let source_idx = match ctx.mods.iter().position(|m| m.def.name == *source) {
                Some(idx) => idx,
                None => return error_reply(404, "unknown source module"),
            };
            ondemand_query(ctx, conn, config, idx, source_idx, &format, params, range, blocking)
        }
        None => direct_query(ctx, conn, config, idx, &format, params, range, blocking),
    };

    match result {
        Ok(body) => (200, content_type(&format), body),
        Err(ComoError::Io(kind)) => error_reply(500, &format!("storage failure: {:?}", kind)),
        Err(err) => error_reply(500, &format!("query failed: {:?}", err)),
    }
}

/// Walks the module's own bytestream and prints records in range.
fn direct_query(
    ctx: &mut QueryCtx,
    conn: &mut StorageConn,
    config: &NodeConfig,
    idx: usize,
    format: &str,
    params: &ArgMap,
    range: (u64, u64),
    blocking: bool,
) -> ComoResult<Vec<u8>> {
    let module = &mut ctx.mods[idx];
    let mode = if blocking {
        OpenMode::Reader
    } else {
        OpenMode::ReaderNonBlock
    };

    let mut file = conn.open(
        &config.db_path,
        &module.def.output,
        mode,
        module.def.stream_size,
    )?;

    let mut body = Vec::new();
    module.runner.print_begin(format, params, &mut body)?;

    let mut ofs = file.get_offset();
    let mut want = SCAN_CHUNK;
    'scan: loop {
        let view = match file.map(conn, ofs, want) {
            Ok(view) => view.to_vec(),
            Err(ComoError::Io(kind)) if kind == std::io::ErrorKind::TimedOut => break,
            Err(err) => return Err(err),
        };
        if view.is_empty() {
            break;
        }

        let mut at = 0;
        while at + record::RECORD_HEADER <= view.len() {
            let (size, ts) = record::load(&view[at..])?;
            if at + size as usize > view.len() {
                break;
            }

            let tsec = ts_secs(ts);
            if tsec >= range.1 {
                break 'scan;
            }
            if tsec >= range.0 {
                let payload = record::payload(&view[at..at + size as usize])?;
                module.runner.print_record(payload, format, params, &mut body)?;
            }
            at += size as usize;
        }

        if at == 0 {
            // A record larger than the view; widen and retry.
            let (size, _) = record::load(&view)?;
            want = (size as usize).max(want * 2);
            continue;
        }

        ofs += at as u64;
        want = SCAN_CHUNK;
    }

    module.runner.print_end(format, params, &mut body)?;
    file.close(conn, 0)?;
    Ok(body)
}

/// Replays the source module's records into packets and feeds them through
/// the queried module's capture and export stages.
fn ondemand_query(
    ctx: &mut QueryCtx,
    conn: &mut StorageConn,
    config: &NodeConfig,
    target_idx: usize,
    source_idx: usize,
    format: &str,
    params: &ArgMap,
    range: (u64, u64),
    blocking: bool,
) -> ComoResult<Vec<u8>> {
    let handle = como_modules::lookup(&ctx.mods[target_idx].def.kind)
        .ok_or(ComoError::Malformed("module kind vanished"))?;

    let mut capture = (handle.capture)(
        ctx.mods[target_idx].def.clone(),
        &ctx.mods[target_idx].config,
        false,
    )?;
    let mut export = (handle.export)(
        ctx.mods[target_idx].def.clone(),
        &ctx.mods[target_idx].config,
    )?;

    // Replay runs against a private pool; nothing here touches the node's
    // shared region.
    let mut pool = Pool::new(Region::anonymous(1 << 22)?, &ctx.log)?;
    let mut sink = MemSink::default();

    let post_filter = match params.get("filter") {
        Some(expr) => Some(Filter::parse(expr)?),
        None => None,
    };

    // Scan the source stream, replaying records into the target pipeline.
    {
        let source = &mut ctx.mods[source_idx];
        let mode = if blocking {
            OpenMode::Reader
        } else {
            OpenMode::ReaderNonBlock
        };
        let mut file = conn.open(
            &config.db_path,
            &source.def.output,
            mode,
            source.def.stream_size,
        )?;

        let mut ofs = file.get_offset();
        let mut want = SCAN_CHUNK;
        'scan: loop {
            let view = match file.map(conn, ofs, want) {
                Ok(view) => view.to_vec(),
                Err(ComoError::Io(kind)) if kind == std::io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err),
            };
            if view.is_empty() {
                break;
            }

            let mut at = 0;
            while at + record::RECORD_HEADER <= view.len() {
                let (size, ts) = record::load(&view[at..])?;
                if at + size as usize > view.len() {
                    break;
                }

                let tsec = ts_secs(ts);
                if tsec >= range.1 {
                    break 'scan;
                }
                if tsec >= range.0 {
                    let payload = record::payload(&view[at..at + size as usize])?;
                    let mut pkts = Vec::new();
                    source.runner.replay(payload, &mut pkts)?;

                    for pkt in &pkts {
                        if let Some(filter) = &post_filter {
                            if !filter.matches(pkt) {
                                continue;
                            }
                        }
                        if let Some(batch) = capture.process(pkt, &mut pool)? {
                            feed_export(&mut *export, batch, &mut sink)?;
                        }
                    }
                }
                at += size as usize;
            }

            if at == 0 {
                let (size, _) = record::load(&view)?;
                want = (size as usize).max(want * 2);
                continue;
            }
            ofs += at as u64;
            want = SCAN_CHUNK;
        }

        file.close(conn, 0)?;
    }

    // Drain the pipeline.
    if let Some(batch) = capture.flush_now(&mut pool)? {
        feed_export(&mut *export, batch, &mut sink)?;
    }
    export.flush_residual(&mut sink)?;

    // Render the regenerated records with the target module's printer.
    let target = &mut ctx.mods[target_idx];
    let mut body = Vec::new();
    target.runner.print_begin(format, params, &mut body)?;
    for (_, rec) in &sink.records {
        let payload = record::payload(rec)?;
        target.runner.print_record(payload, format, params, &mut body)?;
    }
    target.runner.print_end(format, params, &mut body)?;
    Ok(body)
}

fn feed_export(
    export: &mut dyn libcomo::module::ExportRunner,
    batch: libcomo::capture::FlushBatch,
    sink: &mut MemSink,
) -> ComoResult<()> {
    match batch.payload {
        libcomo::capture::FlushPayload::Serialized(data) => {
            export.process_tuples(batch.ntuples, &data, batch.ivl_start, sink)
        }
        libcomo::capture::FlushPayload::Shm { .. } => {
            Err(ComoError::Malformed("shm batch in replay pipeline"))
        }
    }
}

/// Resolves `start`/`end`/`time=A:B` into a half-open range of UNIX
/// seconds. Defaults: start now, no end bound.
pub fn time_range(params: &ArgMap, now: u64) -> ComoResult<(u64, u64)> {
    let mut start = now;
    let mut end = u64::max_value();

    if let Some(expr) = params.get("time") {
        let at = expr
            .find(':')
            .ok_or(ComoError::Malformed("time expression needs a colon"))?;
        start = parse_timearg(&expr[..at], now)?;
        end = parse_timearg(&expr[at + 1..], now)?;
    }

    if let Some(val) = params.get("start") {
        start = val
            .parse()
            .map_err(|_| ComoError::Malformed("bad start bound"))?;
    }
    if let Some(val) = params.get("end") {
        end = val
            .parse()
            .map_err(|_| ComoError::Malformed("bad end bound"))?;
    }

    Ok((start, end))
}

/// One side of a `time=` expression: `0` (now), `@ccyymmddhhmmss` (absolute,
/// shorter prefixes padded), or a signed offset like `-1d2h30m10s`.
pub fn parse_timearg(expr: &str, now: u64) -> ComoResult<u64> {
    let expr = expr.trim();

    if expr.is_empty() || expr == "0" {
        return Ok(now);
    }

    if let Some(stamp) = expr.strip_prefix('@') {
        if stamp.len() > 14 || !stamp.chars().all(|c| c.is_ascii_digit()) {
            return Err(ComoError::Malformed("bad absolute time"));
        }
        // Pad a prefix out to the full ccyymmddhhmmss form.
        let mut full = stamp.to_string();
        full.push_str(&"00000101000000"[stamp.len()..]);

        let parsed = NaiveDateTime::parse_from_str(&full, "%Y%m%d%H%M%S")
            .map_err(|_| ComoError::Malformed("bad absolute time"))?;
        return Ok(parsed.timestamp() as u64);
    }

    let (negative, rest) = match expr.as_bytes()[0] {
        b'-' => (true, &expr[1..]),
        b'+' => (false, &expr[1..]),
        _ => return Err(ComoError::Malformed("bad time expression")),
    };

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ComoError::Malformed("bad time offset"))?;
        digits.clear();

        total += match c {
            'd' => value * 86400,
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return Err(ComoError::Malformed("bad time unit")),
        };
    }
    if !digits.is_empty() {
        return Err(ComoError::Malformed("time offset missing unit"));
    }

    if negative {
        Ok(now.saturating_sub(total))
    } else {
        Ok(now + total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = parse_params("format=html&start=100&wait=no");
        assert_eq!(params.get("format").unwrap(), "html");
        assert_eq!(params.get("start").unwrap(), "100");
        assert_eq!(params.get("wait").unwrap(), "no");
    }

    #[test]
    fn test_timearg_now() {
        assert_eq!(parse_timearg("0", 1000).unwrap(), 1000);
    }

    #[test]
    fn test_timearg_offsets() {
        assert_eq!(parse_timearg("-10s", 1000).unwrap(), 990);
        assert_eq!(parse_timearg("+2m", 1000).unwrap(), 1120);
        assert_eq!(parse_timearg("-1h30m", 10000).unwrap(), 10000 - 5400);
        assert_eq!(parse_timearg("-1d", 100_000).unwrap(), 100_000 - 86400);
    }

    #[test]
    fn test_timearg_absolute() {
        // 2004-06-01 00:00:00 UTC
        let ts = parse_timearg("@20040601000000", 0).unwrap();
        assert_eq!(ts, 1086048000);

        // Prefix pads with month/day defaults.
        let year = parse_timearg("@2004", 0).unwrap();
        assert_eq!(year, 1072915200);
    }

    #[test]
    fn test_timearg_rejects_garbage() {
        assert!(parse_timearg("yesterday", 0).is_err());
        assert!(parse_timearg("-10", 0).is_err());
        assert!(parse_timearg("@notatime", 0).is_err());
    }

    #[test]
    fn test_time_range_compound() {
        let mut params = ArgMap::new();
        params.insert("time".to_string(), "-10s:0".to_string());

        let (start, end) = time_range(&params, 1000).unwrap();
        assert_eq!(start, 990);
        assert_eq!(end, 1000);
    }

    #[test]
    fn test_time_range_start_end_override() {
        let mut params = ArgMap::new();
        params.insert("start".to_string(), "5".to_string());
        params.insert("end".to_string(), "50".to_string());

        let (start, end) = time_range(&params, 1000).unwrap();
        assert_eq!(start, 5);
        assert_eq!(end, 50);
    }
}
