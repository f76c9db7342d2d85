//! Stand-in engine for integration tests.
//!
//! Speaks the engine's HTTP API on the address given by `--urls` and echoes
//! its inputs back in the results so tests can check that every call got its
//! own answer:
//!
//! - difficulty: `maxCombo` is the beatmap id, `mods` the requested mods
//! - performance: `total` is `STUB_TOTAL`, `aim`/`speed`/`accuracy`/`flashlight`
//!   are count300/count100/count50/countmiss and `effectiveMissCount` is combo
//!
//! Behaviour is selected through the environment:
//!
//! - `STUB_MODE`: `healthy` (default), `never-healthy`, `exit`, `ignore-sigterm`
//! - `STUB_TOTAL`: performance total, default `727.0`
//! - `STUB_FAIL_MARKER`: exit with status 1 if this file exists, else create it
//! - `STUB_DELAY_FROM_COMBO`: delay performance replies by `combo` milliseconds
//! - `STUB_STARTUP_DELAY_MS`: wait before binding the port
//! - `STUB_UPLOAD_DIR`: write each uploaded part to `<dir>/<name>` and its
//!   filename to `<dir>/<name>.filename`
//! - `STUB_CHILD_PID_FILE`: spawn a long-lived `sleep` child and write its pid here
//!
//! Uploads are parsed as `multipart/form-data`; a malformed body, a missing
//! part or a part without a filename is answered with 400.
//! Beatmap ids from 900000000 upwards do not exist.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

const MISSING_BEATMAPS_FROM: u32 = 900_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Healthy,
    NeverHealthy,
    Exit,
    IgnoreSigterm,
}

struct Stub {
    mode: Mode,
    total: f64,
    delay_from_combo: bool,
    upload_dir: Option<PathBuf>,
    cache: Mutex<HashSet<u32>>,
}

type Query = HashMap<String, Vec<String>>;

struct Upload {
    filename: Option<String>,
    content: Bytes,
}

type Uploads = HashMap<String, Upload>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_target(false)
        .init();

    let addr = match listen_addr() {
        Ok(addr) => addr,
        Err(message) => {
            error!("{}", message);
            return ExitCode::from(2);
        }
    };

    if let Some(marker) = env::var_os("STUB_FAIL_MARKER") {
        let marker = std::path::PathBuf::from(marker);
        if marker.exists() {
            error!("Failure marker {} present, refusing to start", marker.display());
            return ExitCode::from(1);
        }
        if let Err(e) = std::fs::write(&marker, b"started") {
            error!("Failed to write failure marker: {}", e);
            return ExitCode::from(2);
        }
    }

    let mode = match env::var("STUB_MODE").as_deref() {
        Ok("never-healthy") => Mode::NeverHealthy,
        Ok("exit") => Mode::Exit,
        Ok("ignore-sigterm") => Mode::IgnoreSigterm,
        _ => Mode::Healthy,
    };
    if mode == Mode::Exit {
        error!("Exiting immediately");
        return ExitCode::from(3);
    }

    #[cfg(unix)]
    let _sigterm = if mode == Mode::IgnoreSigterm {
        // Holding the listener replaces the default SIGTERM action.
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return ExitCode::from(2);
            }
        }
    } else {
        None
    };

    // Held for the life of the process.
    let _child = match env::var_os("STUB_CHILD_PID_FILE") {
        Some(pid_file) => match spawn_child(PathBuf::from(pid_file)) {
            Ok(child) => Some(child),
            Err(message) => {
                error!("{}", message);
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    if let Some(ms) = env::var("STUB_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let stub = Arc::new(Stub {
        mode,
        total: env::var("STUB_TOTAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(727.0),
        delay_from_combo: env::var_os("STUB_DELAY_FROM_COMBO").is_some(),
        upload_dir: env::var_os("STUB_UPLOAD_DIR").map(PathBuf::from),
        cache: Mutex::new(HashSet::new()),
    });

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::from(2);
        }
    };
    info!("Now listening on: http://{}", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let stub = stub.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let stub = stub.clone();
                async move { Ok::<_, Infallible>(handle(stub, req).await) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!("Error serving connection: {}", err);
            }
        });
    }
}

fn listen_addr() -> Result<SocketAddr, String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--urls" {
            let url = args.next().ok_or("--urls needs a value")?;
            let authority = url
                .strip_prefix("http://")
                .ok_or_else(|| format!("unsupported url {}", url))?
                .trim_end_matches('/');
            return authority
                .parse()
                .map_err(|e| format!("invalid address {}: {}", authority, e));
        }
    }
    Err("missing --urls".to_string())
}

fn spawn_child(pid_file: PathBuf) -> Result<std::process::Child, String> {
    let child = std::process::Command::new("sleep")
        .arg("300")
        .spawn()
        .map_err(|e| format!("Failed to spawn child: {}", e))?;
    std::fs::write(&pid_file, child.id().to_string())
        .map_err(|e| format!("Failed to write {}: {}", pid_file.display(), e))?;
    Ok(child)
}

async fn handle(stub: Arc<Stub>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or_default());
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)),
    };

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "status"]) => match stub.mode {
            Mode::NeverHealthy => text(StatusCode::SERVICE_UNAVAILABLE, "warming up"),
            _ => text(StatusCode::OK, "ok"),
        },
        (&Method::GET, ["api", "difficulty", id]) => match known_beatmap(&stub, id) {
            Ok(id) => difficulty(&query, id),
            Err(response) => response,
        },
        (&Method::POST, ["api", "difficulty"]) => {
            match uploads(&stub, content_type, body, &["beatmap"]).await {
                Ok(uploads) => difficulty(&query, uploaded_beatmap_id(&uploads)),
                Err(response) => response,
            }
        }
        (&Method::GET, ["api", "performance", id]) => match known_beatmap(&stub, id) {
            Ok(_) => performance(&stub, &query).await,
            Err(response) => response,
        },
        (&Method::POST, ["api", "performance"]) => {
            match uploads(&stub, content_type, body, &["beatmap"]).await {
                Ok(_) => performance(&stub, &query).await,
                Err(response) => response,
            }
        }
        (&Method::GET, ["api", "performance"]) => {
            if !query.contains_key("starrating") {
                return text(StatusCode::BAD_REQUEST, "missing difficulty attributes");
            }
            performance(&stub, &query).await
        }
        (&Method::POST, ["api", "performance", "replay", id]) => {
            if let Err(response) = known_beatmap(&stub, id) {
                return response;
            }
            match uploads(&stub, content_type, body, &["replay"]).await {
                Ok(_) => replay(&stub),
                Err(response) => response,
            }
        }
        (&Method::POST, ["api", "performance", "replay"]) => {
            match uploads(&stub, content_type, body, &["beatmap", "replay"]).await {
                Ok(_) => replay(&stub),
                Err(response) => response,
            }
        }
        (&Method::GET, ["api", "beatmaps", id, "status"]) => {
            let cached = parse_id(id).is_some_and(|id| lock(&stub).contains(&id));
            if cached {
                text(StatusCode::OK, "")
            } else {
                text(StatusCode::NOT_FOUND, "")
            }
        }
        (&Method::GET, ["api", "beatmaps", id]) => match known_beatmap(&stub, id) {
            Ok(id) => text(
                StatusCode::OK,
                format!("osu file format v14\n\n[Metadata]\nBeatmapID:{}\n", id),
            ),
            Err(response) => response,
        },
        (&Method::DELETE, ["api", "beatmaps", "cache"]) => {
            lock(&stub).clear();
            text(StatusCode::OK, "")
        }
        _ => text(StatusCode::METHOD_NOT_ALLOWED, format!("no route for {} {}", method, path)),
    }
}

fn lock(stub: &Stub) -> std::sync::MutexGuard<'_, HashSet<u32>> {
    stub.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves an id path segment, caching it like a downloaded beatmap.
fn known_beatmap(stub: &Stub, segment: &str) -> Result<u32, Response<Full<Bytes>>> {
    let id = parse_id(segment)
        .ok_or_else(|| text(StatusCode::BAD_REQUEST, format!("invalid beatmap id {}", segment)))?;
    if id >= MISSING_BEATMAPS_FROM {
        return Err(text(StatusCode::NOT_FOUND, format!("beatmap {} not found", id)));
    }
    lock(stub).insert(id);
    Ok(id)
}

fn parse_id(segment: &str) -> Option<u32> {
    segment.parse().ok()
}

/// Parses a multipart upload and checks that every `required` part is present.
async fn uploads(
    stub: &Stub,
    content_type: Option<String>,
    body: Bytes,
    required: &[&str],
) -> Result<Uploads, Response<Full<Bytes>>> {
    let uploads = parse_multipart(content_type, body)
        .await
        .map_err(|message| text(StatusCode::BAD_REQUEST, message))?;

    for name in required {
        match uploads.get(*name) {
            Some(upload) if upload.filename.is_some() => {}
            Some(_) => {
                return Err(text(StatusCode::BAD_REQUEST, format!("part {} has no filename", name)))
            }
            None => return Err(text(StatusCode::BAD_REQUEST, format!("missing {}", name))),
        }
    }

    if let Some(dir) = &stub.upload_dir {
        for (name, upload) in &uploads {
            let written = std::fs::write(dir.join(name), &upload.content).and_then(|()| {
                std::fs::write(
                    dir.join(format!("{}.filename", name)),
                    upload.filename.as_deref().unwrap_or_default(),
                )
            });
            if let Err(e) = written {
                error!("Failed to record upload {}: {}", name, e);
            }
        }
    }
    Ok(uploads)
}

async fn parse_multipart(content_type: Option<String>, body: Bytes) -> Result<Uploads, String> {
    let content_type = content_type.ok_or("missing content type")?;
    let boundary = multer::parse_boundary(&content_type)
        .map_err(|e| format!("not a multipart upload ({}): {}", content_type, e))?;
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut uploads = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("malformed multipart body: {}", e))?
    {
        let name = field.name().ok_or("part without a name")?.to_string();
        let filename = field.file_name().map(str::to_string);
        let content = field
            .bytes()
            .await
            .map_err(|e| format!("unreadable part {}: {}", name, e))?;
        uploads.insert(name, Upload { filename, content });
    }
    Ok(uploads)
}

fn uploaded_beatmap_id(uploads: &Uploads) -> u32 {
    let Some(beatmap) = uploads.get("beatmap") else {
        return 0;
    };
    String::from_utf8_lossy(&beatmap.content)
        .lines()
        .find_map(|line| line.trim().strip_prefix("BeatmapID:"))
        .and_then(|id| id.trim().parse().ok())
        .unwrap_or(0)
}

fn difficulty(query: &Query, beatmap_id: u32) -> Response<Full<Bytes>> {
    let mods = query.get("mods").cloned().unwrap_or_default();
    let star_rating = 5.0 + mods.len() as f64 * 0.5;
    respond_json(json!({
        "mods": mods,
        "starRating": star_rating,
        "maxCombo": beatmap_id,
        "aimDifficulty": 2.5,
        "speedDifficulty": 2.25,
        "speedNoteCount": 400.0,
        "flashlightDifficulty": 0.0,
        "sliderFactor": 0.98,
        "approachRate": 9.0,
        "overallDifficulty": 8.5,
        "drainRate": 5.0,
        "hitCircleCount": 1200,
        "sliderCount": 300,
        "spinnerCount": 2
    }))
}

async fn performance(stub: &Stub, query: &Query) -> Response<Full<Bytes>> {
    let counts: Result<Vec<u64>, String> = ["count300", "count100", "count50", "countmiss", "combo"]
        .iter()
        .map(|key| {
            query
                .get(*key)
                .and_then(|values| values.first())
                .ok_or_else(|| format!("missing {}", key))?
                .parse::<u64>()
                .map_err(|e| format!("invalid {}: {}", key, e))
        })
        .collect();
    let counts = match counts {
        Ok(counts) => counts,
        Err(message) => return text(StatusCode::BAD_REQUEST, message),
    };

    if stub.delay_from_combo {
        tokio::time::sleep(Duration::from_millis(counts[4])).await;
    }

    respond_json(json!({
        "total": stub.total,
        "aim": counts[0] as f64,
        "speed": counts[1] as f64,
        "accuracy": counts[2] as f64,
        "flashlight": counts[3] as f64,
        "effectiveMissCount": counts[4] as f64
    }))
}

fn replay(stub: &Stub) -> Response<Full<Bytes>> {
    respond_json(json!({
        "total": stub.total,
        "aim": 0.0,
        "speed": 0.0,
        "accuracy": 0.0,
        "flashlight": 0.0,
        "effectiveMissCount": 0.0
    }))
}

fn parse_query(query: &str) -> Query {
    let mut parsed: Query = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        parsed.entry(decode(key)).or_default().push(decode(value));
    }
    parsed
}

fn respond_json(value: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
}
