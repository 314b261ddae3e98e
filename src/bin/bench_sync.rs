use std::time::Instant;

use anyhow::Result;
use git_ew::mail::{MemoryRepository, Source, Store, SyncCancel, sync};

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "~/Mail/lists".to_string());
    let path = shellexpand::tilde(&path).to_string();

    let source = if path.ends_with(".mbox") || path.ends_with(".gz") {
        Source::mbox("bench", &path)
    } else {
        Source::maildir("bench", &path)
    };

    println!("Syncing: {}", path);
    println!(
        "Available parallelism: {:?}",
        std::thread::available_parallelism()
    );

    // in-memory store, nothing is written
    let store = Store::new(MemoryRepository::new());
    let start = Instant::now();
    let report = sync(&store, std::slice::from_ref(&source), &SyncCancel::default())?;
    let first = start.elapsed();

    let source_report = &report.sources[0];
    if let Some(err) = &source_report.failure {
        anyhow::bail!("{}", err);
    }
    println!(
        "Threaded {} of {} messages into {} threads in {:?} ({} errors)",
        source_report.new,
        source_report.fetched,
        source_report.new_threads,
        first,
        source_report.errors.len()
    );
    println!(
        "Rate: {:.0} emails/sec",
        source_report.fetched as f64 / first.as_secs_f64()
    );

    // Resync: everything is a duplicate now
    let again = Instant::now();
    let report = sync(&store, std::slice::from_ref(&source), &SyncCancel::default())?;
    println!(
        "Resync: {} new, {} duplicates in {:?}",
        report.total_new,
        report.sources[0].duplicates,
        again.elapsed()
    );
    println!("\nTotal: {:?}", start.elapsed());

    Ok(())
}
