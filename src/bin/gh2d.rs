use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use gh2::client;
use gh2::prelude::*;
use gh2::server;
use http::{HeaderValue, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tower::service_fn;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "gh2d")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long)]
    log_level: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an HTTP/2 echo server
    Server {
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Send requests over a single HTTP/2 connection
    Client {
        #[arg(short, long)]
        endpoint: SocketAddr,

        #[arg(short, long, default_value = "/echo")]
        path: String,

        #[arg(short, long, default_value = "hello from gh2")]
        message: String,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Http2Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    gh2::logging::init(&config.logging);

    info!("🚀 gh2d v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Server { bind } => run_server(bind, &config).await,
        Commands::Client {
            endpoint,
            path,
            message,
            count,
        } => run_client(endpoint, path, message, count, &config).await,
    }
}

async fn run_server(bind: SocketAddr, config: &Http2Config) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("📡 HTTP/2 echo server listening on {}", bind);

    let server = server::Builder::from_config(config).build(service_fn(|ctx: ConnectionContext| async move {
        Ok::<_, Infallible>(service_fn(move |request: Request<RecvBody>| echo(ctx, request)))
    }));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                socket.set_nodelay(true)?;
                let server = server.clone();
                tokio::spawn(async move {
                    info!("Accepted connection from {}", peer);
                    if let Err(e) = server.serve(socket).await {
                        error!("Connection from {} failed: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, closing server");
                return Ok(());
            }
        }
    }
}

async fn echo(ctx: ConnectionContext, request: Request<RecvBody>) -> Result<Response<Bytes>, gh2::Error> {
    let body = request.into_body().collect().await?;
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert("x-gh2-stream", HeaderValue::from(ctx.stream_id));
    Ok(response)
}

async fn run_client(
    endpoint: SocketAddr,
    path: String,
    message: String,
    count: usize,
    config: &Http2Config,
) -> Result<()> {
    let socket = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {}", endpoint))?;
    socket.set_nodelay(true)?;

    let connection = client::Builder::from_config(config).connect(socket).await?;
    info!("🔗 Connected to {} ({})", endpoint, connection.id());

    let uri = format!("http://{}{}", endpoint, path);
    let mut pending = Vec::with_capacity(count);
    for _ in 0..count {
        let request = Request::post(uri.as_str()).body(Bytes::from(message.clone()))?;
        pending.push(connection.send(request));
    }

    for result in futures::future::join_all(pending).await {
        let response = result?;
        let status = response.status();
        let stream = response
            .headers()
            .get("x-gh2-stream")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let body = response.into_body().collect().await?;
        println!("{} stream={} {}", status, stream, String::from_utf8_lossy(&body));
    }

    println!("{}", serde_json::to_string_pretty(&connection.stats())?);
    connection.shutdown();
    connection.closed().await;
    Ok(())
}
