use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;
use vpn_control::{
    batch,
    database::Database,
    service::{self, Controller, Peer, PeerRequest, ServiceError},
};

#[derive(Debug, Parser)]
#[clap(about = "WireGuard peer allocation and configuration control")]
struct Config {
    #[clap(
        long,
        short,
        env = "DB",
        value_parser,
        default_value = "sqlite://vpn_control.db"
    )]
    db: String,
    #[clap(flatten)]
    service: service::Config,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[clap(subcommand)]
    Peer(PeerCommand),
    #[clap(subcommand)]
    Owner(OwnerCommand),
    /// Rewrite the live configuration and reload the interface.
    Reconcile,
    /// Pool capacity and occupancy.
    Usage {
        #[clap(long, action)]
        json: bool,
    },
    /// Compare the active peers with the running interface.
    Inspect {
        #[clap(long, action)]
        json: bool,
    },
    /// Render server and client files from a TOML document, no database involved.
    Batch {
        #[clap(long, value_parser, default_value = "config.toml")]
        config: PathBuf,
        #[clap(long, value_parser, default_value = "output")]
        output_dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum PeerCommand {
    Create {
        #[clap(value_parser)]
        owner: String,
        #[clap(value_parser)]
        name: String,
        /// Register an existing key instead of generating one.
        #[clap(long, value_parser)]
        public_key: Option<String>,
        #[clap(long, value_parser, value_delimiter = ',')]
        dns: Vec<String>,
        #[clap(long, value_parser, value_delimiter = ',')]
        allowed_ips: Vec<String>,
        #[clap(long, value_parser)]
        keepalive: Option<u16>,
    },
    Revoke {
        #[clap(value_parser)]
        id: Uuid,
    },
    Restore {
        #[clap(value_parser)]
        id: Uuid,
    },
    List {
        #[clap(long, action)]
        json: bool,
    },
    /// Print the client configuration of a peer.
    Config {
        #[clap(value_parser)]
        id: Uuid,
    },
}

#[derive(Debug, Subcommand)]
enum OwnerCommand {
    /// Delete every peer of the owner and free their addresses.
    Remove {
        #[clap(value_parser)]
        owner: String,
    },
}

#[derive(Serialize)]
struct PeerSummary<'a> {
    id: Uuid,
    owner: &'a str,
    name: &'a str,
    address: String,
    public_key: &'a str,
    revoked: bool,
    created_at: i64,
}

impl<'a> From<&'a Peer> for PeerSummary<'a> {
    fn from(p: &'a Peer) -> Self {
        Self {
            id: p.id,
            owner: &p.owner,
            name: &p.name,
            address: p.address.to_string(),
            public_key: &p.public_key,
            revoked: p.revoked,
            created_at: p.created_at.unix_timestamp(),
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn print_created(peer: &Peer, client_config: Option<&str>) {
    info!("peer {} has id {}", peer.identity(), peer.id);
    match client_config {
        Some(text) => print!("{text}"),
        None => println!("{}\t{}", peer.id, peer.address),
    }
}

async fn controller(db: &str, config: &service::Config) -> Result<Controller, BoxError> {
    let database = Database::new(db).await?;

    Ok(Controller::new(
        config.settings(),
        config.pool()?,
        Arc::new(database),
        config.keys(),
        config.control(),
    ))
}

async fn peer_command(controller: &Controller, command: PeerCommand) -> Result<(), BoxError> {
    match command {
        PeerCommand::Create {
            owner,
            name,
            public_key,
            dns,
            allowed_ips,
            keepalive,
        } => {
            let request = PeerRequest {
                owner,
                name,
                public_key,
                dns,
                client_allowed_ips: allowed_ips,
                persistent_keepalive: keepalive,
            };
            match controller.create_peer(request).await {
                Ok(created) => print_created(&created.peer, created.client_config.as_deref()),
                // the record exists; its private key is only ever shown here
                Err(ServiceError::Diverged {
                    peer,
                    client_config,
                    source,
                }) => {
                    print_created(&peer, client_config.as_deref());
                    return Err(ServiceError::Reconcile(source).into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        PeerCommand::Revoke { id } => {
            controller.revoke_peer(id).await?;
        }
        PeerCommand::Restore { id } => {
            controller.restore_peer(id).await?;
        }
        PeerCommand::List { json } => {
            let peers = controller.peers().await?;
            if json {
                let summary: Vec<PeerSummary> = peers.iter().map(PeerSummary::from).collect();
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for p in &peers {
                    println!(
                        "{}\t{}\t{}\t{}{}",
                        p.id,
                        p.identity(),
                        p.address,
                        p.public_key,
                        if p.revoked { "\trevoked" } else { "" }
                    );
                }
            }
        }
        PeerCommand::Config { id } => {
            print!("{}", controller.client_config(id).await?);
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), BoxError> {
    let Config {
        db,
        service,
        command,
    } = config;
    let open = || controller(&db, &service);

    match command {
        Command::Peer(command) => peer_command(&open().await?, command).await?,
        Command::Owner(OwnerCommand::Remove { owner }) => {
            let (removed, _) = open().await?.remove_owner(&owner).await?;
            println!("{removed}");
        }
        Command::Reconcile => {
            let reconciled = open().await?.reconcile().await?;
            println!(
                "{} peers, {}",
                reconciled.peers,
                if reconciled.changed { "changed" } else { "unchanged" }
            );
        }
        Command::Usage { json } => {
            let controller = open().await?;
            let usage = controller.usage().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                let pool = controller.pool();
                println!(
                    "{} hosts {}..={}: {} used, {} free of {}",
                    pool.network(),
                    pool.start(),
                    pool.end(),
                    usage.used,
                    usage.free,
                    usage.capacity
                );
            }
        }
        Command::Inspect { json } => {
            let drift = open().await?.inspect().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&drift)?);
            } else if drift.is_clean() {
                println!("in sync");
            } else {
                for p in &drift.missing {
                    println!("missing\t{p}");
                }
                for p in &drift.mismatched {
                    println!("mismatched\t{p}");
                }
                for k in &drift.unexpected {
                    println!("unexpected\t{k}");
                }
            }
        }
        Command::Batch { config, output_dir } => {
            let doc = batch::load(&config).await?;
            let generated = batch::generate(&doc, &output_dir).await?;
            println!("{}", generated.server.display());
            for path in &generated.clients {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

/// 2 when the configuration file and the running interface disagree, 1 for
/// every other failure.
fn exit_status(err: &(dyn std::error::Error + 'static)) -> u8 {
    match err.downcast_ref::<ServiceError>() {
        Some(e) if e.is_divergent() => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let status = exit_status(&*e);
            if status == 2 {
                error!(
                    "the configuration file and the running interface disagree; \
                     reconcile again once the cause is fixed"
                );
            }
            ExitCode::from(status)
        }
    }
}
