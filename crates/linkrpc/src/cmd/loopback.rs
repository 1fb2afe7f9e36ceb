use std::sync::Arc;
use std::time::Instant;

use linkrpc_node::{Framing, LocalNode, NodeConfig, NodeStats, PointToPointConnection};
use linkrpc_transport::{duplex, MemoryEndpoint};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::LoopbackArgs;
use crate::exit::{node_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{payload_preview, print, OutputFormat, Render};

const ECHO_ID: i32 = 1;
const REVERSE_ID: i32 = 2;
const NOISE_PREFIX: [u8; 3] = [0x00, 0x13, 0x37];
const NOISE_SUFFIX: u8 = 0x42;

#[derive(Serialize)]
struct CallRecord {
    round: usize,
    function: String,
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    elapsed_us: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct LoopbackReport {
    framing: Framing,
    noise: bool,
    peer_id: u32,
    peer_name: String,
    remote_functions: Vec<String>,
    calls: Vec<CallRecord>,
    client: NodeStats,
    server: NodeStats,
}

impl Render for LoopbackReport {
    fn headers(&self) -> Vec<&'static str> {
        vec!["ROUND", "FUNCTION", "INPUT", "OUTPUT", "ELAPSED_US", "RESULT"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.calls
            .iter()
            .map(|call| {
                vec![
                    call.round.to_string(),
                    call.function.clone(),
                    call.input.clone(),
                    call.output.clone().unwrap_or_else(|| "-".to_string()),
                    call.elapsed_us.to_string(),
                    call.error.clone().unwrap_or_else(|| "ok".to_string()),
                ]
            })
            .collect()
    }
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .map_err(|err| node_error(&format!("loading {}", path.display()), err))?,
        None => NodeConfig::default(),
    };
    if let Some(framing) = args.framing {
        config.framing = framing.into();
    }

    let client = LocalNode::with_config("client", config.clone());
    let server = LocalNode::with_config("server", config.clone());
    server
        .register_function("echo", ECHO_ID, |input| Some(input.to_vec()))
        .map_err(|err| node_error("registering echo", err))?;
    server
        .register_function("reverse", REVERSE_ID, |input| {
            Some(input.iter().rev().copied().collect())
        })
        .map_err(|err| node_error("registering reverse", err))?;

    let (client_end, server_end) = duplex();
    let (client_link, server_link) = (Arc::new(client_end), Arc::new(server_end));
    if args.noise {
        add_noise(&client_link);
        add_noise(&server_link);
    }

    let client_conn = PointToPointConnection::from_arc(client_link.clone());
    let server_conn = PointToPointConnection::from_arc(server_link.clone());
    client_link.set_receiver(client.receiver_for(&client_conn));
    server_link.set_receiver(server.receiver_for(&server_conn));

    server
        .attach_peer(&server_conn)
        .map_err(|err| node_error("attaching client", err))?;
    let peer_id = client
        .register_peer(&client_conn)
        .map_err(|err| node_error("handshake", err))?;
    let handle = client
        .peer(peer_id)
        .ok_or_else(|| CliError::new(INTERNAL, format!("peer {peer_id} vanished after handshake")))?;
    info!(peer = peer_id, framing = ?config.framing, noise = args.noise, "loopback connected");

    let remote_functions: Vec<String> = handle
        .refresh_functions()
        .map_err(|err| node_error("listing remote functions", err))?
        .into_iter()
        .map(|function| function.name)
        .collect();

    let mut calls = Vec::with_capacity(args.calls);
    for round in 0..args.calls {
        let name = if round % 2 == 0 { "echo" } else { "reverse" };
        let function = handle.resolve(name);
        let started = Instant::now();
        let result = handle.call_sync(&function, args.data.as_bytes());
        let elapsed_us = started.elapsed().as_micros();

        let (output, error) = match result {
            Ok(output) => (Some(payload_preview(&output)), None),
            Err(err) => {
                warn!(round, function = name, error = %err, "loopback call failed");
                (None, Some(err.to_string()))
            }
        };
        calls.push(CallRecord {
            round,
            function: name.to_string(),
            input: payload_preview(args.data.as_bytes()),
            output,
            elapsed_us,
            error,
        });
    }

    let failed = calls.iter().any(|call| call.error.is_some());
    let report = LoopbackReport {
        framing: config.framing,
        noise: args.noise,
        peer_id,
        peer_name: handle.name().unwrap_or_default(),
        remote_functions,
        calls,
        client: client.stats(),
        server: server.stats(),
    };
    print(&report, format);

    Ok(if failed { FAILURE } else { SUCCESS })
}

fn add_noise(link: &MemoryEndpoint) {
    link.set_interceptor(|bytes| {
        let mut noisy = NOISE_PREFIX.to_vec();
        noisy.extend_from_slice(bytes);
        noisy.push(NOISE_SUFFIX);
        noisy
    });
}
