use std::collections::HashMap;

use anyhow::Result;
use git_ew::config::Config;
use git_ew::mail::{MemoryRepository, Repository, ThreadingAnomaly};

fn main() -> Result<()> {
    let config = Config::load();
    let Some(path) = config.snapshot_path() else {
        anyhow::bail!("no data directory for the store snapshot");
    };
    let repo = MemoryRepository::open(&path);

    println!("Store: {}", path.display());
    let threads = repo.list_threads()?;
    let total: usize = threads.iter().map(|t| t.message_count).sum();
    println!("  Total messages: {}", total);
    println!("  Threads: {}", threads.len());
    println!(
        "  Patch series: {}",
        threads.iter().filter(|t| t.thread.is_patch_series).count()
    );

    let mut sizes: Vec<(usize, &str)> = threads
        .iter()
        .map(|t| (t.message_count, t.thread.subject.as_str()))
        .collect();
    sizes.sort_by(|a, b| b.0.cmp(&a.0));

    println!("\nThread size distribution:");
    for (label, lo, hi) in [
        ("Single message threads", 1, 1),
        ("2-5 messages", 2, 5),
        ("6-10 messages", 6, 10),
        ("11-50 messages", 11, 50),
        ("50+ messages", 51, usize::MAX),
    ] {
        let count = sizes.iter().filter(|(s, _)| *s >= lo && *s <= hi).count();
        println!("  {}: {}", label, count);
    }

    println!("\nTop 20 largest threads:");
    for (i, (size, subject)) in sizes.iter().take(20).enumerate() {
        let truncated: String = subject.chars().take(50).collect();
        println!("  {:2}. {:4} msgs - {}", i + 1, size, truncated);
    }

    println!("\n--- Checking for issues ---");

    let mut synthetic = 0;
    let mut date_fallback = 0;
    let mut stub_roots = 0;
    let mut anomalies: HashMap<&'static str, usize> = HashMap::new();
    for summary in &threads {
        for msg in repo.thread_messages(summary.thread.id)? {
            synthetic += usize::from(msg.envelope.synthetic_identity);
            date_fallback += usize::from(msg.envelope.date_fallback);
            if msg.parent.is_none() && msg.declared_parents().next().is_some() {
                stub_roots += 1;
            }
            for anomaly in &msg.anomalies {
                let kind = match anomaly {
                    ThreadingAnomaly::SelfReference => "self reference",
                    ThreadingAnomaly::ParentDisagreement { .. } => "parent disagreement",
                    ThreadingAnomaly::CycleRejected { .. } => "cycle rejected",
                };
                *anomalies.entry(kind).or_default() += 1;
            }
        }
    }

    println!("Messages without message-id: {}", synthetic);
    println!("Messages with unusable dates: {}", date_fallback);
    println!("Orphan replies (declared parent not found): {}", stub_roots);
    let mut anomalies: Vec<_> = anomalies.into_iter().collect();
    anomalies.sort();
    for (kind, count) in anomalies {
        println!("Anomaly {}: {}", kind, count);
    }

    Ok(())
}
