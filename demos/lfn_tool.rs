//! Small command-line tool around the logical-name layer, plus a demo of
//! the coordination services against the in-memory store.
//!
//!     cargo run --example lfn_tool -- parse '~scope::sub::file@thor'
//!     cargo run --example lfn_tool -- external 'file::10.0.0.1::c$::tmp::x.txt' --windows
//!     cargo run --example lfn_tool -- demo

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use dfs_names::dmutex::NamedMutex;
use dfs_names::lfn::{BranchKind, LogicalName};
use dfs_names::redirect::Redirection;
use dfs_names::store::memory::MemoryStore;

#[derive(Parser)]
#[command(about = "logical file name inspector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a name and print its canonical pieces.
    Parse { name: String },
    /// Decode an external name into directory and tail.
    External {
        name: String,
        /// Decode with windows path conventions.
        #[arg(long)]
        windows: bool,
    },
    /// Run the mutex and redirection services against an in-memory store.
    Demo,
}

fn show(name: &LogicalName) {
    println!("canonical : {}", name.get(false));
    if name.is_multi() {
        println!("members   : {}", name.multi_ordinality());
        for i in 0..name.multi_ordinality() {
            if let Some(m) = name.multi_item(i) {
                println!("  [{i}]     : {}", m.get(false));
            }
        }
        return;
    }
    println!("tail      : {}", name.tail());
    println!("scopes    : {}", name.scopes(false));
    if let Some(cluster) = name.cluster() {
        println!("cluster   : {cluster}");
    }
    if let Some(ep) = name.endpoint() {
        println!("endpoint  : {ep}");
    }
    println!("foreign   : {}", name.is_foreign());
    println!("external  : {}", name.is_external());
    if !name.is_external() {
        println!("xpath     : {}", name.fullname_query(BranchKind::File, true));
    }
}

async fn demo() {
    let store = MemoryStore::new();
    let holder = store.session();
    let waiter = store.session();

    let held = NamedMutex::new(Arc::new(holder), "demo");
    assert!(held.acquire(None, None).await.expect("acquire"));
    println!("session 1 holds the mutex");

    let contender = Arc::new(NamedMutex::new(Arc::new(waiter.clone()), "demo"));
    let task = {
        let contender = Arc::clone(&contender);
        tokio::spawn(async move {
            contender.acquire(Some(Duration::from_secs(30)), None).await.expect("acquire")
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release().await.expect("release");
    println!("session 1 released; handoff: {}", task.await.expect("join"));
    contender.release().await.expect("release");

    let redirect = Redirection::with_reload_interval(Arc::new(waiter), Duration::ZERO);
    redirect.update("legacy::*", "archive::$1", 0, false).await.expect("update");
    for target in redirect.resolve("legacy::q1").await {
        println!("legacy::q1 redirects to {}", target.get(false));
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Parse { name } => match LogicalName::parse(&name) {
            Ok(parsed) => show(&parsed),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Command::External { name, windows } => {
            let parsed = match LogicalName::parse(&name) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            };
            match parsed.external_path(windows) {
                Ok((dir, tail)) => {
                    println!("dir  : {dir}");
                    println!("tail : {tail}");
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Demo => demo().await,
    }
}
