use anyhow::Result;
use clap::Parser;
use dbws_mcp::config::{LogFormat, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

/// Model Context Protocol server for the database web service
///
/// Exposes database, filesystem and server introspection tools to MCP
/// clients over newline-delimited JSON-RPC.
#[derive(Parser, Debug)]
#[command(name = "dbws-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (overrides $DBWS_MCP_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Serve a single client over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        if self.stdio {
            config.server.stdio = true;
        }
    }
}

fn setup_logging(config: &ServerConfig) -> Result<()> {
    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    match &config.logging.file {
        Some(log_path) => {
            let file = std::fs::File::create(log_path)?;
            init_subscriber(level, config.logging.format, Arc::new(file));
        }
        None => init_subscriber(level, config.logging.format, std::io::stderr),
    }

    Ok(())
}

fn init_subscriber<W>(level: Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn check_config(config: &ServerConfig, source: Option<&std::path::Path>) -> Result<()> {
    match source {
        Some(path) => eprintln!("Loaded configuration from {}", path.display()),
        None => eprintln!("No config file found, using defaults and environment"),
    }

    config.validate()?;
    println!("{}", toml::to_string_pretty(&config.redacted())?);
    eprintln!("Configuration is valid");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = match dbws_mcp::ConfigLoader::new(args.config.clone()) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    let source = loader.source().map(|p| p.to_path_buf());
    let mut config = loader.into_config();
    args.apply(&mut config);

    if args.check_config {
        return check_config(&config, source.as_deref());
    }

    setup_logging(&config)?;

    info!("Starting DBWS-MCP v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &source {
        info!("Configuration file: {}", path.display());
    }

    let server = match dbws_mcp::build_server(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {:#}", e);
            return Err(e);
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    match server.run().await {
        Ok(()) => {
            info!("DBWS-MCP shut down successfully");
            Ok(())
        }
        Err(e) => {
            error!("MCP server error: {:#}", e);
            Err(e)
        }
    }
}
