use chrono::DateTime;
use frecent::config::DATA_DIR_NAME;
use frecent::history::{InMemoryBookmarks, InMemoryHistory};
use frecent::importer::{ProgressSink, ProgressUpdate};
use frecent::ranking::Candidate;
use frecent::types::VisitRecord;
use frecent::visits::PersistMode;
use frecent::Frecent;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;

/// The CLI exits right after each command, so saves are awaited
async fn open() -> Result<Frecent, String> {
    Frecent::open(PersistMode::Await).await
}

/// Run the init command
pub async fn run_init(path: &str) -> Result<(), String> {
    let path = Path::new(path);
    let data_dir = path.join(DATA_DIR_NAME);

    if data_dir.exists() {
        return Err(format!("{} already exists at {}", DATA_DIR_NAME, data_dir.display()));
    }

    let frecent = Frecent::init(path, PersistMode::Await).await?;
    println!("Initialized {} at {}", DATA_DIR_NAME, frecent.data_dir().display());

    Ok(())
}

/// Run the visit command
pub async fn run_visit(url: &str, title: Option<&str>) -> Result<(), String> {
    let frecent = open().await?;

    if !frecent.record_visit(url, title).await {
        return Err(format!("Not a trackable URL: {}", url));
    }

    println!("Visited {} ({} visits)", url, frecent.store().get_count(url));
    Ok(())
}

/// Run the bookmark command
pub async fn run_bookmark(url: &str, title: &str) -> Result<(), String> {
    let frecent = open().await?;

    if !frecent.record_bookmark_open(url, title).await {
        return Err(format!("Not a trackable URL: {}", url));
    }

    println!("Opened bookmark \"{}\" ({} visits)", title, frecent.store().get_count(url));
    Ok(())
}

/// Run the import command
pub async fn run_import(history: &Path, bookmarks: Option<&Path>) -> Result<(), String> {
    let frecent = open().await?;

    if let Some(path) = bookmarks {
        let source = InMemoryBookmarks::from_json_file(path).map_err(|e| e.to_string())?;
        let seeded = frecent.import_bookmarks(&source).await?;
        println!("Seeded {} bookmarks", seeded);
    }

    if !frecent.is_import_needed().await {
        println!("History already imported. Run 'frecent reset' to import again.");
        return Ok(());
    }

    let source = InMemoryHistory::from_json_file(history).map_err(|e| e.to_string())?;

    let (sink, rx) = ProgressSink::channel();
    let printer = tokio::task::spawn_local(print_progress(rx));
    let result = frecent.import_history(source, &sink).await;
    drop(sink);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "progress printer failed");
    }

    if let Some(err) = result.error {
        return Err(format!(
            "Import failed after {} items: {}",
            result.items_processed, err
        ));
    }

    println!("Imported {} history items", result.items_processed);
    println!("  unique urls: {}", result.unique_urls);
    println!("  skipped:     {}", result.skipped);
    if result.error_reports > 0 {
        println!("  error reports: {}", result.error_reports);
    }

    Ok(())
}

async fn print_progress(mut rx: UnboundedReceiver<ProgressUpdate>) {
    while let Some(update) = rx.recv().await {
        let eta = update
            .estimated_remaining
            .map(|d| format!(", ~{}s left", d.as_secs()))
            .unwrap_or_default();
        eprintln!(
            "[{}] {}/{} processed, {} urls, {} skipped{}",
            update.phase.as_str(),
            update.processed,
            update.total,
            update.unique_urls,
            update.skipped,
            eta
        );
        if let Some(message) = update.message {
            eprintln!("  {}", message);
        }
    }
}

/// Run the rank command
pub async fn run_rank(candidates: &Path, limit: Option<usize>, json: bool) -> Result<(), String> {
    let frecent = open().await?;

    let content = fs::read_to_string(candidates)
        .map_err(|e| format!("Failed to read {}: {}", candidates.display(), e))?;
    let candidates: Vec<Candidate<serde_json::Value>> =
        serde_json::from_str(&content).map_err(|e| format!("Invalid candidates file: {}", e))?;

    let mut ranked = frecent.rank(candidates);
    if let Some(n) = limit {
        ranked.truncate(n);
    }

    if json {
        let json = serde_json::to_string_pretty(&ranked)
            .map_err(|e| format!("Failed to serialize: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    if ranked.is_empty() {
        println!("No candidates.");
        return Ok(());
    }

    for entry in ranked {
        let label = match &entry.item {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!(
            "{:>8.4}  fuzzy {:.3}  visits {:<5} {}",
            entry.final_score, entry.fuzzy_score, entry.visit_count, label
        );
    }

    Ok(())
}

/// Run the list command
pub async fn run_list(limit: usize) -> Result<(), String> {
    let frecent = open().await?;
    let entries = frecent.top(limit);

    if entries.is_empty() {
        println!("No visits yet. Record one with: frecent visit <url>");
        return Ok(());
    }

    for (key, record) in entries {
        print_record(&key, &record);
    }

    Ok(())
}

/// Run the stats command
pub async fn run_stats() -> Result<(), String> {
    let frecent = open().await?;
    let stats = frecent.stats().await;

    println!("Visit Statistics");
    println!("================\n");

    println!("Total urls:   {}", stats.total_urls);
    println!("Total visits: {}", stats.total_visits);
    match stats.synced_bytes {
        Some(bytes) => println!("Synced bytes: {}", bytes),
        None => println!("Synced bytes: (unknown)"),
    }
    if !stats.storage_available {
        println!("Storage:      unavailable (in-memory only)");
    }

    let init = &stats.initialization;
    println!("\nHistory import:");
    if init.is_initialized {
        let when = init
            .initialization_date
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "(unknown date)".to_string());
        println!("  done {}, {} items", when, init.items_processed.unwrap_or(0));
    } else if init.permission_denied == Some(true) {
        println!("  permission denied");
    } else if init.partial_completion == Some(true) {
        println!("  incomplete, {} items before failure", init.items_processed.unwrap_or(0));
    } else {
        println!("  not run");
    }

    if !stats.most_visited.is_empty() {
        println!("\nMost visited:");
        for (key, record) in &stats.most_visited {
            println!("  {:40} {}", key, record.count);
        }
    }

    Ok(())
}

/// Run the reset command
pub async fn run_reset(all: bool, force: bool) -> Result<(), String> {
    let frecent = open().await?;

    if all && !force {
        print!("Delete all {} visit records? [y/N] ", frecent.store().len());
        io::stdout().flush().map_err(|e| e.to_string())?;

        let mut input = String::new();
        io::stdin().read_line(&mut input).map_err(|e| e.to_string())?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    frecent.reset(all).await?;
    if all {
        println!("Cleared visit data and import state");
    } else {
        println!("Cleared import state; the next import reads history again");
    }

    Ok(())
}

fn print_record(key: &str, record: &VisitRecord) {
    let last = DateTime::from_timestamp_millis(record.last_visited)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("[{:>4}] {}  {}", record.count, last, key);

    if let Some(title) = record.display_title() {
        let preview: String = title.chars().take(80).collect();
        println!("       {}", preview);
    }
}
