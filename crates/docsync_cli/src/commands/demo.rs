//! Demo command implementation.
//!
//! Seeds an in-process backend, creates a few documents on a simulated
//! device and synchronizes the two while printing every published event.

use docsync_engine::{
    EventKind, HttpResponse, HttpTransport, LocalStore, LoopbackClient, LoopbackServer,
    MemoryStore, SyncConfig, SyncEngine, SyncEvent, SyncOutcome,
};
use docsync_server::{ServerConfig, SyncServer};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const SOLUTION: &str = "demo";
const DEVICE_ID: [u8; 16] = *b"docsync-demo-dev";
const DEMO_SECRET: &[u8] = b"docsync-demo-secret";
const RESTRICTED_TYPE: &str = "ledger";

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One line per event.
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown format {other:?}, expected text or json")),
        }
    }
}

/// Options of the demo command.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Backend documents to seed.
    pub documents: usize,
    /// Backend documents that get an attachment.
    pub attachments: usize,
    /// Documents created on the device.
    pub local: usize,
    /// Pull page size.
    pub page_size: u32,
    /// Output format.
    pub format: Format,
    /// Whether to revoke the token and sync again.
    pub revoke: bool,
}

/// Summary of one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// What the run demonstrates.
    pub label: String,
    /// `NewData`, `NoData` or `Failed`.
    pub result: String,
    /// Failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remote changes applied.
    pub pulled: u64,
    /// Local changes accepted.
    pub accepted: u64,
    /// Local changes rejected.
    pub rejected: u64,
    /// Local changes that stay dirty.
    pub errored: u64,
    /// Run duration in milliseconds.
    pub duration_ms: u64,
}

/// Final state of the demo.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Every run performed.
    pub runs: Vec<RunReport>,
    /// Documents on the device.
    pub local_documents: usize,
    /// Device documents still waiting to be pushed.
    pub dirty_documents: usize,
    /// Attachments known to the device.
    pub attachments: usize,
    /// Documents on the backend.
    pub backend_documents: usize,
    /// Device checkpoint after the last run.
    pub checkpoint: u64,
}

struct Backend(Arc<SyncServer>);

impl LoopbackServer for Backend {
    fn handle(&self, path: &str, access_token: Option<&str>, body: &[u8]) -> HttpResponse {
        let response = self.0.handle_request(path, access_token, body);
        HttpResponse::new(response.status, response.body)
    }
}

/// Runs the demo command.
pub async fn run(options: &DemoOptions) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(SyncServer::new(
        ServerConfig::new()
            .with_auth(DEMO_SECRET.to_vec())
            .with_restricted_type(RESTRICTED_TYPE),
    ));
    seed_backend(&server, options)?;
    let token = server.issue_token(DEVICE_ID)?;

    let store = Arc::new(MemoryStore::new());
    let local_ids = seed_device(&store, options.local)?;

    let transport = HttpTransport::new(
        "loopback://demo",
        LoopbackClient::new(Backend(Arc::clone(&server))).with_chunk_size(256),
    )
    .with_access_token(token.clone());
    let engine = SyncEngine::new(
        SyncConfig::new(SOLUTION).with_pull_page_size(options.page_size),
        transport,
        Arc::clone(&store),
    )?;

    let format = options.format;
    engine
        .events()
        .subscribe_all(move |event| print_event(format, event));

    let mut runs = Vec::new();
    let outcome = engine.start()?.wait().await;
    runs.push(run_report("initial sync", &outcome));
    engine.attachments().wait_idle().await;

    if options.revoke {
        if let Some(id) = local_ids.first() {
            store.update_document(id, b"edited after revocation".to_vec())?;
        }
        server.revoke_token(&token)?;
        info!("device token revoked");
        let outcome = engine.start()?.wait().await;
        runs.push(run_report("after revocation", &outcome));
    }

    let report = DemoReport {
        runs,
        local_documents: store.document_count(),
        dirty_documents: store.dirty_count(),
        attachments: store.attachment_count(),
        backend_documents: server.document_count(SOLUTION),
        checkpoint: store.checkpoint()?.position(),
    };
    engine.close();
    print_report(format, &report)
}

fn seed_backend(
    server: &SyncServer,
    options: &DemoOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    for i in 0..options.documents {
        let id = format!("order-{i:03}");
        let content = format!("{{\"order\":{i},\"status\":\"open\"}}");
        server.put_document(SOLUTION, &id, "order", content.into_bytes());
        if i < options.attachments {
            let scan = vec![(i % 251) as u8; 2048 + i * 512];
            server.put_attachment(SOLUTION, &id, "scan.png", "image/png", scan)?;
        }
    }
    Ok(())
}

fn seed_device(
    store: &MemoryStore,
    count: usize,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        // The last document uses a type the backend refuses.
        let document_type = if count > 1 && i == count - 1 {
            RESTRICTED_TYPE
        } else {
            "note"
        };
        let content = format!("{{\"note\":{i}}}");
        let id = store.create_document(document_type, content.into_bytes())?;
        ids.push(id);
    }
    if let Some(first) = ids.first() {
        store.put_attachment(first, "photo.jpg", "image/jpeg", vec![0xAB; 1500])?;
    }
    Ok(ids)
}

fn run_report(label: &str, outcome: &SyncOutcome) -> RunReport {
    let result = outcome.result();
    RunReport {
        label: label.to_string(),
        result: format!("{:?}", outcome.kind()),
        error: outcome.error().map(ToString::to_string),
        pulled: result.map_or(0, |r| r.pull.applied),
        accepted: result.map_or(0, |r| r.push.accepted),
        rejected: result.map_or(0, |r| r.push.rejected),
        errored: result.map_or(0, |r| r.push.errored),
        duration_ms: result.map_or(0, |r| r.duration.as_millis() as u64),
    }
}

fn print_event(format: Format, event: &SyncEvent) {
    match format {
        Format::Json => {
            let line = serde_json::json!({ "event": event.name(), "payload": &event.payload });
            println!("{line}");
        }
        Format::Text if event.kind == EventKind::AttachmentDidProgress => {}
        Format::Text => {
            let payload = &event.payload;
            let subject = match &payload.attachment_name {
                Some(name) => format!("{}/{}", payload.document_id, name),
                None => payload.document_id.clone(),
            };
            let detail = match (&payload.rejection_reason, &payload.error_code) {
                (Some(reason), _) => format!(" ({reason})"),
                (None, Some(code)) => format!(" (error {code})"),
                (None, None) => String::new(),
            };
            println!("{:<32} {subject}{detail}", event.name());
        }
    }
}

fn print_report(format: Format, report: &DemoReport) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Format::Text => {
            println!();
            for run in &report.runs {
                println!("{}: {}", run.label, run.result);
                if let Some(error) = &run.error {
                    println!("  error: {error}");
                }
                println!(
                    "  pulled {}, accepted {}, rejected {}, errored {} in {} ms",
                    run.pulled, run.accepted, run.rejected, run.errored, run.duration_ms
                );
            }
            println!(
                "device: {} documents ({} dirty), {} attachments, checkpoint #{}",
                report.local_documents,
                report.dirty_documents,
                report.attachments,
                report.checkpoint
            );
            println!("backend: {} documents", report.backend_documents);
        }
    }
    Ok(())
}
