//! TFTP command-line front end: `serve`, `get`, and `put`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{CancelFlag, ServerConfig, TftpClient, TftpServer};

const DEFAULT_BIND: &str = "0.0.0.0:6969"; // use 6969 for non-root testing; redirect or run as root for :69
const DEFAULT_DIR: &str = "./tftp-server-files";
const DEFAULT_SERVER_PORT: u16 = 69;

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client and server (RFC 1350)",
    example = "Run a server:\n  {command_name} serve -d ./files -b 0.0.0.0:69",
    example = "Download a file:\n  {command_name} get 10.0.1.50 boot.img",
    example = "Upload a file:\n  {command_name} put 10.0.1.50 ./boot.img"
)]
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Get(GetArgs),
    Put(PutArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve", description = "run the TFTP server")]
struct ServeArgs {
    #[argh(
        option,
        short = 'b',
        description = "request-port bind address",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'd',
        description = "base directory for served files",
        default = "PathBuf::from(DEFAULT_DIR)"
    )]
    dir: PathBuf,

    #[argh(option, short = 'w', description = "maximum concurrent transfers", default = "10")]
    workers: usize,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get", description = "download a file from a server")]
struct GetArgs {
    #[argh(positional, description = "server host or host:port")]
    server: String,

    #[argh(positional, description = "remote filename")]
    remote: String,

    #[argh(
        option,
        short = 'o',
        description = "destination path (defaults to the remote filename)"
    )]
    output: Option<PathBuf>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put", description = "upload a file to a server")]
struct PutArgs {
    #[argh(positional, description = "server host or host:port")]
    server: String,

    #[argh(positional, description = "local file to upload")]
    local: PathBuf,

    #[argh(
        option,
        short = 'n',
        description = "remote filename (defaults to the local filename)"
    )]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Get(args) => get(args).await,
        Command::Put(args) => put(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut server = TftpServer::new(ServerConfig {
        bind_address: args.bind,
        base_dir: args.dir,
        worker_limit: args.workers,
        ..Default::default()
    });
    server.bind().await.context("failed to bind request socket")?;

    let stop = server.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            stop.stop();
        }
    });

    server.run().await.context("server failed")?;
    Ok(())
}

async fn get(args: GetArgs) -> Result<()> {
    let server = resolve_server(&args.server).await?;
    let dest = match args.output {
        Some(path) => path,
        None => PathBuf::from(
            std::path::Path::new(&args.remote)
                .file_name()
                .context("remote filename has no final component")?,
        ),
    };

    let client = TftpClient::new(server);
    let cancel = CancelFlag::new();
    let bytes = client
        .download(&args.remote, &dest, &cancel, Some(&log_progress))
        .await
        .with_context(|| format!("download of {:?} failed", args.remote))?;

    println!("downloaded {:?} -> {} ({bytes} bytes)", args.remote, dest.display());
    Ok(())
}

async fn put(args: PutArgs) -> Result<()> {
    let server = resolve_server(&args.server).await?;
    let remote = match args.name {
        Some(name) => name,
        None => args
            .local
            .file_name()
            .context("local path has no filename")?
            .to_string_lossy()
            .into_owned(),
    };

    let client = TftpClient::new(server);
    let cancel = CancelFlag::new();
    let bytes = client
        .upload(&args.local, &remote, &cancel, Some(&log_progress))
        .await
        .with_context(|| format!("upload of {} failed", args.local.display()))?;

    println!("uploaded {} -> {remote:?} ({bytes} bytes)", args.local.display());
    Ok(())
}

fn log_progress(transferred: u64, total: Option<u64>) {
    match total {
        Some(total) => tracing::debug!("progress: {transferred}/{total} bytes"),
        None => tracing::debug!("progress: {transferred} bytes"),
    }
}

/// Accept `host` or `host:port`, defaulting to the well-known port 69.
async fn resolve_server(spec: &str) -> Result<SocketAddr> {
    let spec = if spec.contains(':') {
        spec.to_string()
    } else {
        format!("{spec}:{DEFAULT_SERVER_PORT}")
    };
    let addr = tokio::net::lookup_host(&spec)
        .await
        .with_context(|| format!("cannot resolve server address {spec:?}"))?
        .next()
        .with_context(|| format!("no usable address for {spec:?}"));
    addr
}
