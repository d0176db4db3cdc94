use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{debug, info};

use gamenet::{
    setup_tracing, AppResult, Connection, Frame, HandlerFactory, PacketHandler, Server,
    ServerConfig,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// directory for the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Sends every frame straight back with the same opcode.
struct EchoHandler;

impl PacketHandler for EchoHandler {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        let (opcode, payload) = frame.into_parts();
        if !connection.send_frame(opcode, &payload) {
            debug!(
                "connection {} could not take echo of opcode {}",
                connection.id(),
                opcode
            );
        }
    }

    fn on_connect(&self, connection: &Arc<Connection>) {
        info!("player connected from {}", connection.remote_address());
    }

    fn on_disconnect(&self, connection: &Connection) {
        info!(
            "player from {} left after {} frames",
            connection.remote_address(),
            connection.stats().frames_received()
        );
    }
}

fn main() -> AppResult<()> {
    // 加载 .env 文件
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = setup_tracing(&commandline.log_dir, level)?;

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let factory = HandlerFactory::new(
        Arc::new(EchoHandler),
        config.buffers.read_buffer_size,
        config.buffers.write_buffer_size,
    );
    let server = Server::new(config, Arc::new(factory))?;
    server.run()
}
