//! Permission broker: a stand-alone stdio process the agent CLI invokes
//! through its MCP mechanism. It owns its own chat connection and blocks
//! each `permission_prompt` call until a human reacts (or the wait times
//! out). stdout is the RPC channel, so logs go to stderr only.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use tether_platform::ChatPlatform;

pub mod approval;
pub mod env;
pub mod jsonrpc;
mod message_processor;

use crate::env::BrokerEnv;
use crate::jsonrpc::JsonRpcMessage;
use crate::message_processor::MessageProcessor;

/// Size of the bounded channels between the stdio tasks. Permission
/// traffic is low-volume; 128 is generous.
const CHANNEL_CAPACITY: usize = 128;

pub async fn run_main(platform: Arc<dyn ChatPlatform>, broker_env: BrokerEnv) -> IoResult<()> {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

    // Task: read stdin lines, parse, push to `incoming_tx`.
    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(message) => {
                    if incoming_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to parse JSON-RPC frame: {e}"),
            }
        }
        debug!("stdin reader finished (EOF)");
    });

    // Task: process incoming messages.
    let processor_handle = tokio::spawn(async move {
        let mut processor = MessageProcessor::new(outgoing_tx, platform, broker_env);
        while let Some(message) = incoming_rx.recv().await {
            processor.process(message);
        }
        info!("processor task exited (channel closed)");
    });

    // Task: write outgoing messages to stdout, one frame per line.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if stdout.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdout.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if stdout.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSON-RPC frame: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // The usual exit path: the agent closes our stdin, the reader drops
    // `incoming_tx`, and shutdown propagates through the pipeline.
    let _ = tokio::join!(stdin_reader_handle, processor_handle, stdout_writer_handle);
    Ok(())
}
