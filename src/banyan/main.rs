// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Operator tool for planned fibre networks

use anyhow::{Context, bail};
use clap::Parser;
use fibreplan::config::PlannerConfig;
use fibreplan::drawing::HeadlessCanvas;
use fibreplan::ingest::{IngestStats, build_network, read_payload, upload_network_files};
use fibreplan::network_graph::NetworkGraph;
use fibreplan::persistence::{
    DownloadFormat, HttpPersistenceGateway, Notification, PersistenceGateway,
};
use fibreplan::route_edit::RouteEditEngine;
use fibreplan::routing_service::HttpRoutingService;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
    #[arg(long, global = true)]
    routing_url: Option<String>,
    #[arg(long, global = true)]
    persistence_url: Option<String>,
    #[arg(long, global = true)]
    upload_url: Option<String>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    user_id: Option<String>,
    #[arg(long, global = true)]
    user_name: Option<String>,
    #[arg(long, global = true)]
    max_download_bytes: Option<usize>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Ingest a network payload and report lengths and unresolved endpoints
    Summary { payload: PathBuf },
    /// Send point and connection files to the upload service
    Upload {
        points: PathBuf,
        connections: PathBuf,
        /// Write the returned network payload here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Save a network, or verify and save it with --verify
    Save {
        payload: PathBuf,
        #[arg(long)]
        verify: bool,
    },
    /// Export a network as kml or csv
    Download {
        payload: PathBuf,
        #[arg(long, default_value = "kml")]
        format: DownloadFormat,
    },
    /// Ask for alternative routes between two points and adopt one
    Reroute {
        payload: PathBuf,
        origin: String,
        destination: String,
        #[arg(long, default_value_t = 0)]
        rank: usize,
        /// Save the network afterwards
        #[arg(long)]
        save: bool,
    },
}

impl Args {
    fn apply_overrides(&self, config: &mut PlannerConfig) {
        if let Some(v) = &self.routing_url {
            config.routing_base_url = v.clone();
        }
        if let Some(v) = &self.persistence_url {
            config.persistence_base_url = v.clone();
        }
        if let Some(v) = &self.upload_url {
            config.upload_base_url = v.clone();
        }
        if let Some(v) = &self.download_dir {
            config.download_dir = v.clone();
        }
        if let Some(v) = &self.user_id {
            config.user.user_id = v.clone();
        }
        if let Some(v) = &self.user_name {
            config.user.user_name = v.clone();
        }
        if let Some(v) = self.max_download_bytes {
            config.max_download_bytes = v;
        }
    }
}

fn print_summary(graph: &NetworkGraph, stats: &IngestStats) {
    println!(
        "{} points ({} skipped, {} without coordinates)",
        stats.points, stats.skipped_points, stats.points_without_coordinates
    );
    println!(
        "{} connections ({} skipped), {} segments",
        stats.connections,
        stats.skipped_connections,
        graph.segments().len()
    );
    println!(
        "existing {:.3} km, proposed {:.3} km, total {:.3} km",
        graph.existing_length(),
        graph.proposed_length(),
        graph.total_length()
    );
    if let Some(rect) = graph.bounds() {
        println!(
            "extent [{:.5}, {:.5}] to [{:.5}, {:.5}]",
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y
        );
    }
    for u in graph.unresolved() {
        println!("unresolved {:?} endpoint '{}' on {}", u.side, u.reference, u.segment);
    }
}

async fn load(path: &Path) -> anyhow::Result<(NetworkGraph, IngestStats)> {
    let payload = read_payload(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(build_network(&payload))
}

fn report(note: Notification) -> anyhow::Result<()> {
    if note.is_success() {
        println!("{}", note.message);
        Ok(())
    } else {
        bail!(note.message)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let mut config = PlannerConfig::from_env()?;
    args.apply_overrides(&mut config);

    let gateway = HttpPersistenceGateway::new(&config.persistence_base_url, &config.download_dir)
        .with_max_payload_bytes(config.max_download_bytes);

    match args.cmd {
        Command::Summary { payload } => {
            let (graph, stats) = load(&payload).await?;
            print_summary(&graph, &stats);
        }
        Command::Upload {
            points,
            connections,
            out,
        } => {
            let client = reqwest::Client::new();
            let payload =
                upload_network_files(&client, &config.upload_base_url, &points, &connections)
                    .await?;
            let (graph, stats) = build_network(&payload);
            print_summary(&graph, &stats);

            if let Some(out) = out {
                tokio::fs::write(&out, serde_json::to_vec_pretty(&payload)?).await?;
                info!("wrote network payload to {}", out.display());
            }
        }
        Command::Save { payload, verify } => {
            let (graph, _) = load(&payload).await?;
            let note = if verify {
                gateway.verify_and_save(&graph, &config.user).await
            } else {
                gateway.save(&graph, &config.user).await
            };
            report(note)?;
        }
        Command::Download { payload, format } => {
            let (graph, _) = load(&payload).await?;
            report(gateway.download(&graph, &config.user, format).await)?;
        }
        Command::Reroute {
            payload,
            origin,
            destination,
            rank,
            save,
        } => {
            let (graph, _) = load(&payload).await?;
            let routing = HttpRoutingService::new(&config.routing_base_url);

            let mut engine = RouteEditEngine::new(HeadlessCanvas::new());
            engine.load_network(graph);

            let count = engine
                .request_candidates(&routing, &origin, &destination)
                .await?;
            println!("{} candidate routes", count);

            let key = engine.select_candidate(rank)?;
            if let Some(detail) = engine.graph().segment(&key) {
                println!("adopted {} ({:.3} km)", key, detail.connection.length_km);
            }

            if save {
                report(gateway.save(engine.graph(), &config.user).await)?;
            }
        }
    }

    Ok(())
}
