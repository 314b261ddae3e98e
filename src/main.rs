use anyhow::{Context, Result, bail};
use git_ew::config::Config;
use git_ew::mail::{
    MemoryRepository, SendmailTransport, Store, SyncCancel, ThreadFilter, ThreadId, ThreadStatus,
    ThreadView, Workspace, reply_preview, tree_prefix,
};
use tracing::info;

const USAGE: &str = "\
usage: git-ew [--json] <command>

commands:
  sync                                   sync every enabled source
  threads [open|closed]                  list threads, newest activity first
  show <thread-id>                       print a thread as a tree
  status <thread-id> <open|closed>       open or close a thread
  reply <thread-id> <body-file> [msg-id] reply to a message (default: thread root)";

fn main() -> Result<()> {
    git_ew::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let args: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--json")
        .collect();

    let config = Config::load();
    let workspace = open_workspace(&config);

    match args.as_slice() {
        ["sync"] => run_sync(&workspace, &config),
        ["threads"] => list_threads(&workspace, None, json),
        ["threads", status] => list_threads(&workspace, Some(parse_status(status)?), json),
        ["show", id] => show_thread(&workspace, parse_thread(id)?, json),
        ["status", id, status] => {
            let id = parse_thread(id)?;
            workspace.set_thread_status(id, parse_status(status)?)?;
            println!("thread {} is now {}", id, status);
            Ok(())
        }
        ["reply", id, body_file] => reply(&workspace, parse_thread(id)?, body_file, None),
        ["reply", id, body_file, target] => {
            reply(&workspace, parse_thread(id)?, body_file, Some(*target))
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn open_workspace(config: &Config) -> Workspace<MemoryRepository, SendmailTransport> {
    let repo = match config.snapshot_path() {
        Some(path) => {
            info!(path = %path.display(), "opening store");
            MemoryRepository::open(path)
        }
        None => MemoryRepository::new(),
    };
    Workspace::new(Store::new(repo), config.composer(), config.transport())
}

fn parse_thread(s: &str) -> Result<ThreadId> {
    s.parse::<ThreadId>()
        .with_context(|| format!("invalid thread id `{}`", s))
}

fn parse_status(s: &str) -> Result<ThreadStatus> {
    s.parse::<ThreadStatus>().map_err(anyhow::Error::msg)
}

fn run_sync(workspace: &Workspace, config: &Config) -> Result<()> {
    let sources = config.sources();
    if sources.is_empty() {
        bail!(
            "no sources configured, add [[sources]] to {}",
            Config::path().display()
        );
    }

    let report = workspace.run_sync(&sources, &SyncCancel::default())?;
    for source in &report.sources {
        match &source.failure {
            Some(err) => println!("{:<16} failed: {}", source.source, err),
            None => println!(
                "{:<16} {:>6} fetched {:>6} new {:>6} dup {:>4} threads {:>3} merged {:>3} errors",
                source.source,
                source.fetched,
                source.new,
                source.duplicates,
                source.new_threads,
                source.merges,
                source.errors.len()
            ),
        }
    }
    println!("{} new messages", report.total_new);
    if report.cancelled {
        println!("sync cancelled");
    }
    Ok(())
}

fn list_threads(workspace: &Workspace, status: Option<ThreadStatus>, json: bool) -> Result<()> {
    let threads = workspace.list_threads(&ThreadFilter {
        status,
        ..Default::default()
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&threads)?);
        return Ok(());
    }

    for summary in &threads {
        let thread = &summary.thread;
        println!(
            "{:>6}  {:<6}  {:>4}  {}  {}{}",
            thread.id,
            thread.status,
            summary.message_count,
            thread.updated_at.format("%Y-%m-%d %H:%M"),
            if thread.is_patch_series { "[patch] " } else { "" },
            thread.subject
        );
    }
    Ok(())
}

fn show_thread(workspace: &Workspace, id: ThreadId, json: bool) -> Result<()> {
    let Some(view) = workspace.get_thread(id)? else {
        bail!("thread {} does not exist", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    print_tree(&view);
    Ok(())
}

fn print_tree(view: &ThreadView) {
    let thread = &view.thread;
    println!("#{} [{}] {}", thread.id, thread.status, thread.subject);

    // interior nodes of a single-reply run are folded into a count
    let mut folded = 0;
    for (node, msg) in view.forest.iter().zip(&view.messages) {
        if node.flattenable {
            folded += 1;
            continue;
        }
        if folded > 0 {
            println!("{}   ({} more)", "   ".repeat(node.render_depth), folded);
            folded = 0;
        }

        let envelope = &msg.envelope;
        println!(
            "{}{}  {}  {}{}",
            tree_prefix(node.render_depth, node.is_last_sibling),
            envelope.sender.display(),
            envelope.sent_at.format("%Y-%m-%d %H:%M"),
            if envelope.is_patch { "[patch] " } else { "" },
            envelope.subject
        );
        let indent = "   ".repeat(node.render_depth);
        if let Some(preview) = reply_preview(&envelope.body, 72) {
            println!("{}   {}", indent, preview);
        }
        for anomaly in &msg.anomalies {
            println!("{}   ! {}", indent, anomaly);
        }
    }
}

fn reply(workspace: &Workspace, id: ThreadId, body_file: &str, target: Option<&str>) -> Result<()> {
    let path = shellexpand::tilde(body_file).into_owned();
    let body = std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path))?;

    let sent = workspace.post_comment(id, &body, target)?;
    println!("sent <{}> in reply to <{}>", sent.identity, sent.in_reply_to);
    Ok(())
}
