use linkrpc_frame::{Frame, StreamReassembler};
use serde::Serialize;
use tracing::debug;

use crate::cmd::{DecodeArgs, FrameEncodeArgs};
use crate::exit::{frame_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{payload_preview, print, print_raw, to_hex, OutputFormat, Render};

#[derive(Serialize)]
struct EncodedFrame {
    command: &'static str,
    frame_id: u16,
    payload_size: usize,
    wire_size: usize,
    wire: String,
}

impl Render for EncodedFrame {
    fn headers(&self) -> Vec<&'static str> {
        vec!["COMMAND", "FRAME_ID", "PAYLOAD", "WIRE_SIZE", "WIRE"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        vec![vec![
            self.command.to_string(),
            self.frame_id.to_string(),
            self.payload_size.to_string(),
            self.wire_size.to_string(),
            self.wire.clone(),
        ]]
    }
}

pub fn encode(args: FrameEncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = args.payload.resolve()?;
    let frame = Frame::new(args.command.into(), args.id, payload);
    let wire = frame
        .to_bytes()
        .map_err(|err| frame_error("encode failed", err))?;

    if format == OutputFormat::Raw {
        print_raw(&wire);
        return Ok(SUCCESS);
    }

    print(
        &EncodedFrame {
            command: frame.command.name(),
            frame_id: frame.frame_id,
            payload_size: frame.payload.len(),
            wire_size: wire.len(),
            wire: to_hex(&wire),
        },
        format,
    );
    Ok(SUCCESS)
}

#[derive(Serialize)]
struct DecodedFrame {
    index: usize,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct DecodeReport {
    input_size: usize,
    frames: Vec<DecodedFrame>,
    /// Bytes left waiting for an end marker.
    buffered: usize,
}

impl Render for DecodeReport {
    fn headers(&self) -> Vec<&'static str> {
        vec!["INDEX", "COMMAND", "FRAME_ID", "PAYLOAD", "RESULT"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.frames
            .iter()
            .map(|frame| {
                vec![
                    frame.index.to_string(),
                    frame.command.unwrap_or("-").to_string(),
                    frame
                        .frame_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    frame.preview.clone().unwrap_or_default(),
                    frame.error.clone().unwrap_or_else(|| "ok".to_string()),
                ]
            })
            .collect()
    }
}

pub fn decode(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let input = args.resolve()?;
    let mut reassembler = StreamReassembler::new();
    let frames: Vec<DecodedFrame> = reassembler
        .feed(&input)
        .into_iter()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(frame) => DecodedFrame {
                index,
                ok: true,
                command: Some(frame.command.name()),
                frame_id: Some(frame.frame_id),
                payload: Some(to_hex(&frame.payload)),
                preview: Some(payload_preview(&frame.payload)),
                error: None,
            },
            Err(err) => DecodedFrame {
                index,
                ok: false,
                command: None,
                frame_id: None,
                payload: None,
                preview: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    debug!(input = input.len(), candidates = frames.len(), "stream decoded");

    let report = DecodeReport {
        input_size: input.len(),
        buffered: reassembler.buffered(),
        frames,
    };
    print(&report, format);

    if report.frames.iter().any(|frame| frame.ok) {
        Ok(SUCCESS)
    } else {
        Ok(DATA_INVALID)
    }
}
