use linkrpc_frame::FrameCommand;
use linkrpc_node::{decode_packet, NodeError, Packet};
use serde::Serialize;

use crate::cmd::{DecodeArgs, PacketEncodeArgs};
use crate::exit::{node_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{payload_preview, print, print_json, print_raw, to_hex, OutputFormat, Render};

#[derive(Serialize)]
struct PacketRecord {
    command: &'static str,
    sequence: i16,
    data_length: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_sn: Option<i32>,
    payload: String,
    preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    wire: Option<String>,
}

impl PacketRecord {
    fn new(packet: &Packet, wire: Option<&[u8]>) -> Self {
        let carries_call = matches!(packet.command, FrameCommand::Request | FrameCommand::Response);
        Self {
            command: packet.command.name(),
            sequence: packet.sequence,
            data_length: packet.data_length,
            function_id: carries_call.then_some(packet.function_id),
            request_sn: carries_call.then_some(packet.request_sn),
            payload: to_hex(packet.payload()),
            preview: payload_preview(packet.payload()),
            wire: wire.map(to_hex),
        }
    }
}

impl Render for PacketRecord {
    fn headers(&self) -> Vec<&'static str> {
        vec!["COMMAND", "SEQUENCE", "DATA_LENGTH", "FUNCTION", "REQUEST_SN", "PAYLOAD"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        let optional = |value: Option<i32>| value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        vec![vec![
            self.command.to_string(),
            self.sequence.to_string(),
            self.data_length.to_string(),
            optional(self.function_id),
            optional(self.request_sn),
            self.preview.clone(),
        ]]
    }
}

pub fn encode(args: PacketEncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = args.payload.resolve()?;
    let packet = match FrameCommand::from(args.command) {
        FrameCommand::Request => Packet::request(args.sequence, args.function, args.request_sn, payload),
        FrameCommand::Response => Packet::response(args.sequence, args.function, args.request_sn, payload),
        control => Packet::control(control, args.sequence),
    };
    let wire = packet
        .serialize()
        .map_err(|err| node_error("encode failed", NodeError::Packet(err)))?;

    if format == OutputFormat::Raw {
        print_raw(&wire);
        return Ok(SUCCESS);
    }
    print(&PacketRecord::new(&packet, Some(&wire[..])), format);
    Ok(SUCCESS)
}

#[derive(Serialize)]
struct DecodeFailure {
    ok: bool,
    input_size: usize,
    error: String,
}

pub fn decode(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let input = args.resolve()?;
    match decode_packet(&input) {
        Ok(packet) => {
            print(&PacketRecord::new(&packet, None), format);
            Ok(SUCCESS)
        }
        Err(err) => {
            if matches!(format, OutputFormat::Json | OutputFormat::Raw) {
                print_json(&DecodeFailure {
                    ok: false,
                    input_size: input.len(),
                    error: err.to_string(),
                });
            } else {
                eprintln!("invalid packet: {err}");
            }
            Ok(DATA_INVALID)
        }
    }
}
