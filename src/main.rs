use std::{net::SocketAddrV4, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use oceanbt::{
    swarm::generate_peer_id, ClientConfig, DirectPeers, DownloadProgress, HttpTracker, Info,
    PeerFinder, Swarm, TorrentFile,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .torrent file
    torrent_file: PathBuf,

    /// Listening port for inbound peer connections
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Output root the downloaded files are laid out under
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// Skip the tracker and use these host:port peers instead
    #[arg(long)]
    direct: Vec<SocketAddrV4>,
}

fn show_progress(progress: DownloadProgress) {
    tracing::info!(
        "{}: {:.1}% ({}/{} pieces, {} peers)",
        progress.state,
        progress.percent,
        progress.finished_pieces,
        progress.total_pieces,
        progress.peer_count,
    );
}

async fn download<F>(info: Info, finder: F, config: ClientConfig) -> anyhow::Result<()>
where
    F: PeerFinder + Send + Sync + 'static,
{
    let swarm = Swarm::new(info, finder, config).await?;
    let mut handle = swarm.handle();
    let mut last = DownloadProgress::default();
    let run = tokio::spawn(swarm.run(move |progress: DownloadProgress| {
        if progress.finished_pieces != last.finished_pieces
            || progress.peer_count != last.peer_count
            || progress.state != last.state
        {
            show_progress(progress.clone());
            last = progress;
        }
    }));

    tokio::select! {
        _ = handle.wait_complete() => {
            tracing::info!("Download finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }
    handle.stop();
    run.await.context("swarm task panicked")?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let torrent = TorrentFile::from_path(&args.torrent_file).context("open torrent file")?;
    tracing::info!(
        "Opened {} (info hash {})",
        args.torrent_file.display(),
        torrent.info.hex_hash()
    );
    print!("{}", torrent.info);

    let peer_id = generate_peer_id();
    let config = ClientConfig {
        port: args.port,
        download_dir: args.download_dir,
        local_peer_id: Some(peer_id),
        ..Default::default()
    };

    if args.direct.is_empty() {
        let tracker = HttpTracker {
            announce: torrent.announce.clone(),
            info_hash: torrent.info.hash(),
            peer_id,
            port: config.port,
            left: torrent.info.total_size(),
        };
        download(torrent.info, tracker, config).await
    } else {
        download(torrent.info, DirectPeers(args.direct), config).await
    }
}
