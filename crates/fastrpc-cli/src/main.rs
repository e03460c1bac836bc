//! # FastRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo methods over TCP
//! fastrpc serve -b 127.0.0.1:2030
//!
//! # ... or over a Unix domain socket
//! fastrpc serve --unix /tmp/fastrpc.sock
//!
//! # Make an RPC call (one JSON value per result item on stdout)
//! fastrpc call 127.0.0.1:2030 echo -a '["hello", 17]'
//! fastrpc call --unix /tmp/fastrpc.sock yes -a '[{"count": 3, "value": "y"}]'
//! ```

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use fastrpc_client::{ClientConfig, FastClient};
use fastrpc_server::{FastServer, ServerConfig, ServerHandle};
use futures_util::StreamExt;
use serde_json::Value;

#[derive(FromArgs)]
/// FastRPC - Fast protocol RPC server and client
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for running the demo server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo RPC methods
struct ServeArgs {
    /// TCP address to listen on
    #[argh(option, short = 'b', default = "\"127.0.0.1:2030\".into()")]
    bind: String,

    /// listen on this Unix domain socket instead of TCP
    #[argh(option)]
    unix: Option<String>,

    /// responses buffered per connection before handlers have to wait
    #[argh(option, long = "queue-depth", default = "64")]
    queue_depth: usize,

    /// largest request payload accepted, in bytes
    #[argh(option, long = "max-message-size")]
    max_message_size: Option<usize>,
}

/// Arguments for making a single RPC call.
///
/// Output is one line of JSON per result item, so it can be piped into
/// tools like `jq`. A failed call prints nothing and exits non-zero.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make an RPC call
struct CallArgs {
    /// server address: host:port, or a socket path with --unix
    #[argh(positional)]
    server_address: String,

    /// RPC method name
    #[argh(positional)]
    method: String,

    /// arguments as a JSON array
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// treat the address as a Unix domain socket path
    #[argh(switch)]
    unix: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut server = FastServer::new(ServerConfig {
        outbound_queue_depth: args.queue_depth,
        max_message_size: args.max_message_size,
    });
    fastrpc_cli::demo::register_demo_methods(&mut server)?;

    let handle = match &args.unix {
        Some(path) => serve_unix(server, path)?,
        None => {
            let listener = tokio::net::TcpListener::bind(&args.bind)
                .await
                .with_context(|| format!("failed to bind {}", args.bind))?;
            tracing::info!("listening on {}", listener.local_addr()?);
            server.serve(listener)
        }
    };

    tokio::select! {
        _ = handle.closed() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("interrupted, shutting down");
            handle.close();
            handle.closed().await;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn serve_unix(server: FastServer, path: &str) -> Result<ServerHandle> {
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path))?;
    tracing::info!("listening on {}", path);
    Ok(server.serve(listener))
}

#[cfg(not(unix))]
fn serve_unix(_server: FastServer, _path: &str) -> Result<ServerHandle> {
    bail!("Unix domain sockets are not supported on this platform")
}

async fn run_call(args: CallArgs) -> Result<()> {
    let argv = match serde_json::from_str::<Value>(&args.args).context("invalid JSON in args")? {
        Value::Array(argv) => argv,
        other => bail!("args must be a JSON array, got {}", other),
    };

    let client = connect(&args).await?;
    let mut request = client.rpc(&args.method, argv);
    while let Some(item) = request.next().await {
        println!("{}", serde_json::to_string(&item?)?);
    }
    Ok(())
}

async fn connect(args: &CallArgs) -> Result<FastClient> {
    let config = ClientConfig::default();
    let client = if args.unix {
        connect_unix(&args.server_address, config).await?
    } else {
        FastClient::connect_tcp(&args.server_address, config)
            .await
            .with_context(|| format!("failed to connect to {}", args.server_address))?
    };
    Ok(client)
}

#[cfg(unix)]
async fn connect_unix(path: &str, config: ClientConfig) -> Result<FastClient> {
    FastClient::connect_unix(path, config)
        .await
        .with_context(|| format!("failed to connect to {}", path))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &str, _config: ClientConfig) -> Result<FastClient> {
    bail!("Unix domain sockets are not supported on this platform")
}
