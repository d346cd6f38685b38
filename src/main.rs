use axum::{
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::prelude::*;
use clap::Parser;
use humansize::{format_size, BINARY};
use maud::{html, Markup, DOCTYPE};
use rust_embed::RustEmbed;
use std::{
    fs::Metadata,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tokio::fs;
use tower::ServiceExt; // Needed to drive ServeFile with the original request
use tower_http::{services::ServeFile, trace::TraceLayer};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

// --- Configuration ---
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The root data directory to expose
    #[arg(short, long, value_name = "DIR")]
    root_dir: PathBuf,

    /// The network address to listen on
    #[arg(short, long, value_name = "ADDR", default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// The port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

// --- State ---
type SharedState = Arc<AppState>;

struct AppState {
    root_dir: PathBuf,
}

// --- Embedded Assets ---
#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

/// Document served in place of any asset path that misses the bundle.
const ASSET_NOT_FOUND: &str = "404.html";

// --- View Model ---

/// One ancestor segment of the current directory path.
struct Breadcrumb {
    name: String,
    path: String,
}

/// One row of a directory listing.
struct FileItem {
    name: String,
    size: String,     // Human-readable size (KiB, MiB)
    modified: String, // Relative modification time ("3 days ago")
    is_dir: bool,
    link: String, // Request-prefix-joined path for the entry's anchor
}

/// Classification of a resolved request path.
enum ResolvedTarget {
    Missing,
    Directory,
    RegularFile(Metadata),
}

// --- Main Application ---
#[tokio::main]
async fn main() {
    // --- Setup (Args parsing, Tracing, Root Dir validation) ---
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let root_dir = match fs::canonicalize(&args.root_dir).await {
        Ok(path) => path,
        Err(e) => {
            error!(
                "Failed to resolve root directory '{}': {}. Exiting.",
                args.root_dir.display(),
                e
            );
            eprintln!(
                "Error: Failed to resolve root directory '{}': {}",
                args.root_dir.display(),
                e
            );
            std::process::exit(1);
        }
    };

    if !root_dir.is_dir() {
        error!(
            "Root path '{}' is not a directory. Exiting.",
            root_dir.display()
        );
        eprintln!(
            "Error: Root path '{}' is not a directory.",
            root_dir.display()
        );
        std::process::exit(1);
    }

    let addr = SocketAddr::new(args.bind_addr, args.port);
    info!("Exposing data directory: {}", root_dir.display());
    info!("Listening on: {}", addr);

    let state = Arc::new(AppState { root_dir });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            eprintln!("Error: Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app(state)).await {
        error!("Server error: {}", e);
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Builds the application router: the embedded asset route plus a catch-all
/// for the data directory.
fn app(state: SharedState) -> Router {
    Router::new()
        .route("/assets/*path", get(asset_handler))
        .fallback(get(serve_index))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        // Provide state to handlers
        .with_state(state)
}

// --- Handlers ---

/// Serves the data route: resolves the request path under the root directory
/// and dispatches on what it finds there.
async fn serve_index(State(state): State<SharedState>, req: Request) -> Response {
    let requested = req.uri().path().to_string();

    // --- Security: clean the request path *before* joining it under root ---
    let relative = clean_request_path(&requested);
    let full_path = if relative.as_os_str().is_empty() {
        state.root_dir.clone()
    } else {
        state.root_dir.join(&relative)
    };
    let display = display_path(&state.root_dir, &full_path);
    let shown = if display.is_empty() { "/" } else { display.as_str() };

    match resolve_target(&full_path).await {
        Ok(ResolvedTarget::Missing) => {
            info!("404 - {}", shown);
            (StatusCode::NOT_FOUND, not_found_page()).into_response()
        }
        Ok(ResolvedTarget::Directory) => match build_listing(&full_path, &display).await {
            Ok(files) => {
                let breadcrumbs = build_breadcrumbs(&display);
                info!("200 - DIR {}", shown);
                directory_page(shown, &breadcrumbs, &files).into_response()
            }
            Err(e) => {
                error!("Failed to read directory {}: {}", full_path.display(), e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        Ok(ResolvedTarget::RegularFile(metadata)) => {
            info!(
                "200 - FILE {} ({})",
                shown,
                format_size(metadata.len(), BINARY)
            );
            stream_file(&full_path, req).await
        }
        Err(e) => {
            error!("Failed to stat {}: {}", full_path.display(), e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Streams a regular file as an attachment download.
///
/// Conditional and range semantics (200/206/304, Last-Modified freshness)
/// are delegated to tower-http's file service; only the download hint is
/// added on top.
async fn stream_file(path: &Path, req: Request) -> Response {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download"); // Fallback filename

    let mut response = match ServeFile::new(path).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(infallible) => match infallible {},
    };

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""));
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    response
}

/// Serves files from the embedded asset bundle. A path that misses the
/// bundle is answered with the bundled not-found document instead of an
/// error; only a bundle missing its own fallback is a server error.
async fn asset_handler(AxumPath(path): AxumPath<String>) -> Response {
    let (resolved, file) = match Assets::get(&path) {
        Some(file) => (path.as_str(), file),
        None => match Assets::get(ASSET_NOT_FOUND) {
            Some(file) => (ASSET_NOT_FOUND, file),
            None => {
                error!("Asset bundle is missing its fallback document");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
    };

    let mime_type = mime_guess::from_path(resolved)
        .first_or_octet_stream()
        .to_string();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime_type)],
        file.data.into_owned(),
    )
        .into_response()
}

// --- Path Resolution ---

/// Cleans up a request path, removing traversal attempts.
/// Returns a relative PathBuf that is safe to join under the root directory;
/// an empty result means the root itself was requested.
fn clean_request_path(path_str: &str) -> PathBuf {
    // Decode URL encoding first
    let decoded =
        urlencoding::decode(path_str).map_or_else(|_| path_str.to_string(), |p| p.into_owned());
    let mut clean = PathBuf::new();
    for component in Path::new(&decoded).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            // Handle '..' by popping the last component, preventing climbing
            // up *before* joining with root
            Component::ParentDir => {
                clean.pop();
            }
            // Ignore RootDir, CurDir, Prefix entirely as we build relative
            // to our root
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    clean
}

/// Returns the resolved path relative to the root directory, in URL form:
/// "" for the root itself, "/a/b" for anything deeper.
fn display_path(root: &Path, full_path: &Path) -> String {
    let relative = full_path
        .strip_prefix(root)
        .unwrap_or(Path::new(""))
        .to_string_lossy()
        .replace('\\', "/");
    if relative.is_empty() {
        relative
    } else {
        format!("/{}", relative)
    }
}

/// Classifies what a resolved path points at with a single stat. Only a
/// missing path maps to `Missing`; any other I/O failure is the caller's to
/// surface.
async fn resolve_target(path: &Path) -> std::io::Result<ResolvedTarget> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(ResolvedTarget::Directory),
        Ok(metadata) => Ok(ResolvedTarget::RegularFile(metadata)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ResolvedTarget::Missing),
        Err(e) => Err(e),
    }
}

// --- View Construction ---

/// Builds the breadcrumb trail for a display path. Crumbs are collected
/// leaf-first while peeling segments off the path, then reversed into
/// root-to-leaf order; the root itself gets no crumb.
fn build_breadcrumbs(display: &str) -> Vec<Breadcrumb> {
    let mut segments: Vec<&str> = display.split('/').collect();
    let mut crumbs = Vec::new();
    while segments.len() > 1 {
        crumbs.push(Breadcrumb {
            name: segments[segments.len() - 1].to_string(),
            path: segments.join("/"),
        });
        segments.pop();
    }
    crumbs.reverse();
    crumbs
}

/// Enumerates the immediate children of a directory into listing rows.
/// Entries come back in whatever order the filesystem yields them; no
/// sorting or hidden-file filtering is applied.
async fn build_listing(dir: &Path, prefix: &str) -> std::io::Result<Vec<FileItem>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push(FileItem {
            link: format!("{}/{}", prefix, name),
            size: format_size(metadata.len(), BINARY), // Using BINARY (KiB, MiB)
            modified: metadata.modified().map(humanize_mtime).unwrap_or_default(),
            is_dir: metadata.is_dir(),
            name,
        });
    }
    Ok(files)
}

/// Renders a modification time relative to the current wall clock.
fn humanize_mtime(modified: SystemTime) -> String {
    let then: DateTime<Local> = modified.into();
    humanize_delta(Local::now().signed_duration_since(then))
}

fn humanize_delta(delta: chrono::Duration) -> String {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    const WEEK: i64 = 7 * DAY;
    const MONTH: i64 = 30 * DAY;
    const YEAR: i64 = 365 * DAY;

    let secs = delta.num_seconds();
    // Also covers mtimes in the future (clock skew)
    if secs < 2 {
        return "just now".to_string();
    }
    let (count, unit) = if secs < MINUTE {
        (secs, "second")
    } else if secs < HOUR {
        (secs / MINUTE, "minute")
    } else if secs < DAY {
        (secs / HOUR, "hour")
    } else if secs < WEEK {
        (secs / DAY, "day")
    } else if secs < MONTH {
        (secs / WEEK, "week")
    } else if secs < YEAR {
        (secs / MONTH, "month")
    } else {
        (secs / YEAR, "year")
    };
    if count == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", count, unit)
    }
}

// --- Views using Maud ---

/// Percent-encodes each segment of an href path, leaving separators intact.
fn encode_href(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// The directory listing page.
fn directory_page(current: &str, breadcrumbs: &[Breadcrumb], files: &[FileItem]) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { "Index of " (current) }
                link rel="stylesheet" href="/assets/styles.css";
                script src="/assets/app.js" defer {}
            }
            body {
                nav class="breadcrumbs" {
                    a href="/" { "Home" }
                    @for crumb in breadcrumbs {
                        span class="separator" { "/" }
                        a href=(encode_href(&crumb.path)) { (crumb.name) }
                    }
                }
                input #filter type="search" placeholder="Filter entries..." autocomplete="off";
                table class="listing" {
                    thead {
                        tr { th { "Name" } th { "Size" } th { "Modified" } }
                    }
                    tbody {
                        @for item in files {
                            tr data-name=(item.name) {
                                td class="name" {
                                    span class="icon" {
                                        @if item.is_dir { "📁" } @else { "📄" }
                                    }
                                    a href=(encode_href(&item.link)) { (item.name) }
                                }
                                td class="size" { (item.size) }
                                td class="modified" { (item.modified) }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// The fixed page served for any data path that does not exist.
fn not_found_page() -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                title { "404 Not Found" }
                link rel="stylesheet" href="/assets/styles.css";
            }
            body class="error-page" {
                h1 { "404" }
                p { "The path you requested does not exist under this index." }
                a href="/" { "Back to the index" }
            }
        }
    }
}

// --- Utility Functions ---

/// Generic error response carrying nothing but the status text; failure
/// detail stays in the logs.
fn error_response(status: StatusCode) -> Response {
    let body = status
        .canonical_reason()
        .unwrap_or("Internal Server Error")
        .to_string();
    (status, body).into_response()
}
