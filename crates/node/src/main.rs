//! ctxwire
//!
//! Serve contexts to peers or call the contexts a peer serves.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use node::config::Config;
use node::context::{Context, ContextBuilder};
use node::router::Router;
use node::transport;
use protocol::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// ctxwire - expose objects to peers and call theirs.
#[derive(Parser, Debug)]
#[command(name = "ctxwire")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Listen for peers and serve the built-in `system` context
    Serve {
        /// Address to listen on (overrides the configuration)
        #[arg(long, short)]
        listen: Option<String>,
    },

    /// Invoke a method on a peer's context
    Call {
        /// Peer address, e.g. 127.0.0.1:8642
        addr: String,

        /// Context name
        context: String,

        /// Method name
        method: String,

        /// Arguments; each is parsed as JSON, falling back to a plain string
        args: Vec<String>,
    },

    /// List the contexts a peer exposes
    Contexts {
        /// Peer address
        addr: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    // RUST_LOG wins, then --verbose, then the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(config.node.log_level.to_lowercase())
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| config.network.listen_addr.clone());
            serve(&config, &addr).await
        }
        Commands::Call {
            addr,
            context,
            method,
            args,
        } => {
            let args = args.iter().map(|a| parse_arg(a)).collect();
            call(&config, &addr, &context, &method, args).await
        }
        Commands::Contexts { addr } => list_contexts(&config, &addr).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: &Config, addr: &str) -> anyhow::Result<()> {
    let router = Router::new(config.router_config());
    router
        .attach_context("system", system_context(Instant::now()))
        .await?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    tracing::info!("Serving as {} on {}", router.uid(), addr);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(transport::serve_tcp(
        router.clone(),
        listener,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    router.shutdown().await;
    server.await.context("Listener task panicked")??;
    Ok(())
}

async fn call(
    config: &Config,
    addr: &str,
    context: &str,
    method: &str,
    args: Vec<Value>,
) -> anyhow::Result<()> {
    let router = Router::new(config.router_config());
    let peer = transport::connect_tcp(&router, addr, config.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let result = async {
        let remote = router.interface(peer, context)?;
        remote.call(method, args).await
    }
    .await
    .with_context(|| format!("{}.{} failed", context, method));
    router.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?.to_json())?);
    Ok(())
}

async fn list_contexts(config: &Config, addr: &str) -> anyhow::Result<()> {
    let router = Router::new(config.router_config());
    let peer = transport::connect_tcp(&router, addr, config.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let definitions = router.remote_definitions(peer);
    router.shutdown().await;

    println!("Peer {}", peer);
    for def in definitions? {
        let methods: Vec<&str> = def.methods().collect();
        let properties: Vec<&str> = def.properties().collect();
        println!("  {} (#{})", def.name, def.id);
        if !def.description.is_empty() {
            println!("    {}", def.description);
        }
        println!("    methods:    {}", methods.join(", "));
        println!("    properties: {}", properties.join(", "));
    }
    Ok(())
}

/// Parse a command-line argument as JSON, or keep it as a string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::from(raw))
}

/// The context every `serve` instance exposes.
fn system_context(started: Instant) -> Arc<dyn Context> {
    ContextBuilder::new("system")
        .description("Built-in node information")
        .sync_method("ping", |_| Ok(Value::from("pong")))
        .sync_method("echo", |args| {
            Ok(match args.len() {
                0 => Value::Null,
                1 => args.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(args),
            })
        })
        .sync_method("uptime", move |_| Ok(Value::UInt(started.elapsed().as_secs())))
        .readonly("version", || Ok(Value::from(env!("CARGO_PKG_VERSION"))))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use node::context::Output;
    use protocol::Capability;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["ctxwire", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { listen: None }));

        let cli = Cli::try_parse_from(["ctxwire", "serve", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_call_command() {
        let cli = Cli::try_parse_from([
            "ctxwire", "call", "127.0.0.1:8642", "system", "echo", "1", "hello",
        ])
        .unwrap();
        match cli.command {
            Commands::Call {
                addr,
                context,
                method,
                args,
            } => {
                assert_eq!(addr, "127.0.0.1:8642");
                assert_eq!(context, "system");
                assert_eq!(method, "echo");
                assert_eq!(args, vec!["1", "hello"]);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["ctxwire", "config", "--verbose", "-c", "/tmp/c.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), Value::UInt(42));
        assert_eq!(parse_arg("-1"), Value::Int(-1));
        assert_eq!(parse_arg("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_arg("bare words"), Value::from("bare words"));
        assert_eq!(
            parse_arg("[1, true]"),
            Value::Array(vec![Value::UInt(1), Value::Bool(true)])
        );
    }

    #[tokio::test]
    async fn test_system_context() {
        let ctx = system_context(Instant::now());
        let caps = ctx.capabilities();
        assert_eq!(caps["ping"], Capability::Method);
        assert_eq!(caps["version"], Capability::readonly());

        match ctx.invoke("echo", vec![Value::from("x")]).await.unwrap() {
            Output::Value(v) => assert_eq!(v, Value::from("x")),
            Output::Context(_) => panic!("unexpected context"),
        }
        match ctx.read("version", vec![]).await.unwrap() {
            Output::Value(v) => assert_eq!(v, Value::from(env!("CARGO_PKG_VERSION"))),
            Output::Context(_) => panic!("unexpected context"),
        }
    }
}
