use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, debug, info};

use gorrent::cli::Args;
use gorrent::downloader::DownloadManager;
use gorrent::error::{Result, TorrentError};
use gorrent::launcher::{MAX_CONCURRENT_HANDSHAKES, run_limited};
use gorrent::metainfo::TorrentMetadata;
use gorrent::peer::PeerSession;
use gorrent::progress::ProgressDisplay;
use gorrent::storage::FileStore;
use gorrent::tracker::{HttpTrackerClient, TrackerClient};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    pretty_env_logger::formatted_timed_builder()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .init();

    match run(args).await {
        Ok(()) => println!("Download complete."),
        Err(e) => {
            eprintln!("unable to download: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let metadata = TorrentMetadata::load(&args.torrent)?;
    info!(
        "loaded {} ({} pieces of {} bytes, {} bytes total)",
        metadata.name,
        metadata.num_pieces(),
        metadata.piece_length,
        metadata.total_length
    );
    debug!("info hash {}", hex::encode(metadata.info_hash));

    let store = Arc::new(FileStore::create(&metadata, Path::new(&args.output)).await?);
    let have = store.initial_bitfield().await;
    if have.has_any() {
        info!(
            "resuming: {}/{} pieces already on disk",
            have.count_set(),
            metadata.num_pieces()
        );
    }
    if have.is_complete() {
        return Ok(());
    }

    let tracker = HttpTrackerClient::new(reqwest::Client::new());
    let announce = tracker.announce(&metadata).await?;
    info!(
        "tracker returned {} peers (interval {}s)",
        announce.peers.len(),
        announce.interval
    );

    let info_hash = metadata.info_hash;
    let local_id = announce.local_id;
    let ops: Vec<_> = announce
        .peers
        .iter()
        .copied()
        .map(|peer| {
            let local_bitfield = have.clone();
            async move { PeerSession::connect(peer, info_hash, local_id, &local_bitfield).await }
        })
        .collect();
    let (sessions, failures) = run_limited(ops, MAX_CONCURRENT_HANDSHAKES).await;
    for failure in &failures {
        debug!("peer connection failed: {:#}", failure);
    }
    if sessions.is_empty() {
        return Err(TorrentError::NoPeers.into());
    }
    info!("{} peer sessions established", sessions.len());

    let sessions: Vec<Arc<PeerSession>> = sessions.into_iter().map(Arc::new).collect();
    let manager = Arc::new(DownloadManager::new(&metadata, sessions, store, &have));

    if !args.verbose {
        spawn_progress_display(Arc::clone(&manager));
    }

    manager
        .run()
        .await
        .with_context(|| format!("downloading {}", metadata.name))
}

fn spawn_progress_display(manager: Arc<DownloadManager>) {
    let cancel = manager.cancellation();
    tokio::spawn(async move {
        let mut display = ProgressDisplay::new();
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => display.print(&manager.snapshot().await),
            }
        }
        // one final frame so 100% is visible
        display.print(&manager.snapshot().await);
    });
}
