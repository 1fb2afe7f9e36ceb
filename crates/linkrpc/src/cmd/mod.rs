use std::io::Read;
use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};
use linkrpc_frame::FrameCommand;
use linkrpc_node::Framing;

use crate::exit::{io_error, CliError, CliResult};
use crate::output::{parse_hex, OutputFormat};

pub mod frame;
pub mod loopback;
pub mod packet;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode or decode link frames.
    #[command(subcommand)]
    Frame(FrameAction),
    /// Encode or decode RPC packets.
    #[command(subcommand)]
    Packet(PacketAction),
    /// Run two in-process nodes over a memory link and call between them.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Frame(FrameAction::Encode(args)) => frame::encode(args, format),
        Command::Frame(FrameAction::Decode(args)) => frame::decode(args, format),
        Command::Packet(PacketAction::Encode(args)) => packet::encode(args, format),
        Command::Packet(PacketAction::Decode(args)) => packet::decode(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Subcommand, Debug)]
pub enum FrameAction {
    /// Build one frame and print its wire bytes.
    Encode(FrameEncodeArgs),
    /// Carve and decode every frame in a byte stream.
    Decode(DecodeArgs),
}

#[derive(Subcommand, Debug)]
pub enum PacketAction {
    /// Build one packet and print its wire bytes.
    Encode(PacketEncodeArgs),
    /// Decode one packet.
    Decode(DecodeArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CommandArg {
    Request,
    Response,
    Retry,
    Busy,
    Free,
}

impl From<CommandArg> for FrameCommand {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::Request => FrameCommand::Request,
            CommandArg::Response => FrameCommand::Response,
            CommandArg::Retry => FrameCommand::Retry,
            CommandArg::Busy => FrameCommand::Busy,
            CommandArg::Free => FrameCommand::Free,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    Raw,
    Framed,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Raw => Framing::Raw,
            FramingArg::Framed => Framing::Framed,
        }
    }
}

#[derive(Args, Debug)]
pub struct PayloadArgs {
    /// UTF-8 string payload.
    #[arg(long, conflicts_with_all = ["hex", "file"])]
    pub data: Option<String>,
    /// Hex payload (e.g. "01 11 21 31").
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub hex: Option<String>,
    /// Read payload bytes from a file.
    #[arg(long, conflicts_with_all = ["data", "hex"])]
    pub file: Option<PathBuf>,
}

impl PayloadArgs {
    pub fn resolve(&self) -> CliResult<Vec<u8>> {
        if let Some(data) = &self.data {
            return Ok(data.as_bytes().to_vec());
        }
        if let Some(hex) = &self.hex {
            return parse_hex(hex).map_err(|err| CliError::usage(format!("--hex: {err}")));
        }
        if let Some(path) = &self.file {
            return std::fs::read(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
        }
        Ok(Vec::new())
    }
}

#[derive(Args, Debug)]
pub struct FrameEncodeArgs {
    /// Frame command.
    #[arg(long, value_enum, default_value = "request")]
    pub command: CommandArg,
    /// Frame id.
    #[arg(long, default_value_t = 0)]
    pub id: u16,
    #[command(flatten)]
    pub payload: PayloadArgs,
}

#[derive(Args, Debug)]
pub struct PacketEncodeArgs {
    /// Packet command.
    #[arg(long, value_enum, default_value = "request")]
    pub command: CommandArg,
    /// Packet sequence number.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub sequence: i16,
    /// Function id (request/response only).
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub function: i32,
    /// Request number (request/response only).
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub request_sn: i32,
    #[command(flatten)]
    pub payload: PayloadArgs,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex input. Without it, raw bytes are read from --file or stdin.
    #[arg(conflicts_with = "file")]
    pub hex: Option<String>,
    /// Read raw bytes from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl DecodeArgs {
    pub fn resolve(&self) -> CliResult<Vec<u8>> {
        if let Some(hex) = &self.hex {
            return parse_hex(hex).map_err(|err| CliError::usage(format!("input: {err}")));
        }
        if let Some(path) = &self.file {
            return std::fs::read(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
        }
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .map_err(|err| io_error("failed reading stdin", err))?;
        Ok(bytes)
    }
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Wire framing; overrides the config file.
    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,
    /// Node configuration (JSON).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Number of echo calls to make.
    #[arg(long, default_value_t = 3)]
    pub calls: usize,
    /// Payload for each call.
    #[arg(long, default_value = "ping")]
    pub data: String,
    /// Surround every transmission with garbage bytes.
    #[arg(long)]
    pub noise: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
