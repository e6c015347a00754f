use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tabletop_sync::{
    flatten, BoardSession, FlatMap, MemoryStore, StoreStats, SyncConfig, SyncError, WorldDocument,
};
use tokio::time::Instant;

use crate::cli::Cli;

/// Flat keys an import of `document` writes, pieces numbered from `start`.
pub fn import_delta(document: &WorldDocument, start: u64) -> Result<FlatMap, SyncError> {
    let mut pieces = serde_json::Map::new();
    for (offset, piece) in document.require_pieces()?.iter().enumerate() {
        pieces.insert((start + offset as u64).to_string(), piece.to_value());
    }
    Ok(flatten(&json!({ "pieces": pieces })))
}

/// Counts shown by `inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSummary {
    pub pieces: usize,
    pub locked: usize,
    pub faces: usize,
    pub flat_keys: usize,
    pub bounds: Option<(f64, f64, f64, f64)>,
}

pub fn summarize(document: &WorldDocument) -> Result<BoardSummary, SyncError> {
    let pieces = document.require_pieces()?;
    let bounds = pieces.iter().fold(None, |acc: Option<(f64, f64, f64, f64)>, p| {
        Some(match acc {
            None => (p.x, p.y, p.x, p.y),
            Some((x0, y0, x1, y1)) => (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)),
        })
    });
    Ok(BoardSummary {
        pieces: pieces.len(),
        locked: pieces.iter().filter(|p| p.lock).count(),
        faces: pieces.iter().map(|p| p.faces.len()).sum(),
        flat_keys: import_delta(document, 0)?.len(),
        bounds,
    })
}

fn load_config(cli: &Cli) -> Result<SyncConfig, SyncError> {
    match &cli.config {
        Some(path) => SyncConfig::from_path(path),
        None => Ok(SyncConfig::default()),
    }
}

pub fn flatten_board(cli: &Cli, board: &Path, start_index: u64) -> Result<(), SyncError> {
    let document = WorldDocument::from_path(board)?;
    let delta = import_delta(&document, start_index)?;
    if cli.json {
        println!("{}", json!(delta));
    } else {
        for (key, value) in &delta {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

pub fn inspect(cli: &Cli, board: &Path) -> Result<(), SyncError> {
    let document = WorldDocument::from_path(board)?;
    let summary = summarize(&document)?;
    if cli.json {
        println!(
            "{}",
            json!({
                "pieces": summary.pieces,
                "locked": summary.locked,
                "faces": summary.faces,
                "flat_keys": summary.flat_keys,
                "bounds": summary.bounds.map(|(x0, y0, x1, y1)| json!([x0, y0, x1, y1])),
            })
        );
        return Ok(());
    }
    println!("Board:     {}", board.display());
    println!("Pieces:    {} ({} locked)", summary.pieces, summary.locked);
    println!("Faces:     {}", summary.faces);
    println!("Flat keys: {}", summary.flat_keys);
    if let Some((x0, y0, x1, y1)) = summary.bounds {
        println!("Bounds:    ({x0}, {y0}) .. ({x1}, {y1})");
    }
    Ok(())
}

/// Outcome of one simulated board load.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub expected: usize,
    /// Live pieces seen by each client, in join order.
    pub clients: Vec<(String, usize)>,
    pub elapsed: Duration,
    pub store: StoreStats,
}

impl SimulationReport {
    pub fn converged(&self) -> bool {
        self.clients.iter().all(|(_, count)| *count == self.expected)
    }

    fn counts(&self) -> Vec<usize> {
        self.clients.iter().map(|(_, count)| *count).collect()
    }

    pub fn ensure_converged(&self) -> Result<(), SyncError> {
        if self.converged() {
            Ok(())
        } else {
            Err(SyncError::NotConverged {
                expected: self.expected,
                counts: self.counts(),
            })
        }
    }
}

/// Connect `clients` sessions to `store`, load `document` through the first
/// one and poll until every client sees it or `timeout` passes.
pub async fn run_simulation(
    store: Arc<MemoryStore>,
    document: &WorldDocument,
    base: &SyncConfig,
    clients: usize,
    timeout: Duration,
) -> Result<SimulationReport, SyncError> {
    let mut sessions = Vec::with_capacity(clients.max(1));
    for i in 0..clients.max(1) {
        let config = SyncConfig {
            client_id: format!("{}-{i}", base.client_id),
            ..base.clone()
        };
        let mut session = BoardSession::new(store.clone(), config);
        session.start().await;
        sessions.push(session);
    }

    let started = Instant::now();
    let expected = sessions[0].load_document(document, true).await?.len();
    sessions[0].wait_idle().await;
    log::info!("Board submitted after {:?}", started.elapsed());

    let deadline = started + timeout;
    let counts = loop {
        let mut counts = Vec::with_capacity(sessions.len());
        for session in &sessions {
            counts.push(session.pieces().await.len());
        }
        if counts.iter().all(|c| *c == expected) || Instant::now() >= deadline {
            break counts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    Ok(SimulationReport {
        expected,
        clients: sessions
            .iter()
            .map(|s| s.client_id().to_string())
            .zip(counts)
            .collect(),
        elapsed: started.elapsed(),
        store: store.stats(),
    })
}

pub async fn simulate(
    cli: &Cli,
    board: &Path,
    clients: usize,
    timeout_secs: u64,
) -> Result<(), SyncError> {
    let document = WorldDocument::from_path(board)?;
    let base = load_config(cli)?;
    // A long run would otherwise keep every submission around.
    let store = Arc::new(MemoryStore::new(base.notification_capacity).with_log_capacity(0));
    let report = run_simulation(
        store,
        &document,
        &base,
        clients,
        Duration::from_secs(timeout_secs),
    )
    .await?;
    let converged = report.converged();

    let stats = &report.store;
    if cli.json {
        let clients: Vec<_> = report
            .clients
            .iter()
            .map(|(id, count)| json!({ "client_id": id, "pieces": count }))
            .collect();
        println!(
            "{}",
            json!({
                "expected_pieces": report.expected,
                "converged": converged,
                "elapsed_ms": report.elapsed.as_millis() as u64,
                "clients": clients,
                "store": {
                    "submissions": stats.submissions,
                    "failed_submissions": stats.failed_submissions,
                    "keys_written": stats.keys_written,
                    "keys_removed": stats.keys_removed,
                    "stored_keys": stats.stored_keys,
                },
            })
        );
    } else {
        println!(
            "Loaded {} pieces in {:?} ({})",
            report.expected,
            report.elapsed,
            if converged { "converged" } else { "NOT converged" }
        );
        for (id, count) in &report.clients {
            println!("  {id:<40} {count} pieces");
        }
        println!(
            "Store: {} submissions, {} keys written, {} keys removed, {} keys stored",
            stats.submissions, stats.keys_written, stats.keys_removed, stats.stored_keys
        );
    }

    if !converged {
        log::warn!("Clients did not converge within {timeout_secs}s");
    }
    report.ensure_converged()
}
