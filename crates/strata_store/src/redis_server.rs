//! RESP2 front-end for a shard node.
//!
//! Write commands run through the proposer; reads are served from the local
//! store. Errors become `-ERR <kind>` replies.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::info;

use crate::errors::{Result, StoreError};
use crate::node::KvNode;
use crate::state_machine::{parse_i64, Value};

pub async fn run(addr: SocketAddr, node: Arc<KvNode>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, node).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener, node: Arc<KvNode>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "redis listener started");
    loop {
        let (socket, _) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, node).await {
                tracing::debug!(error = ?err, "redis connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, node: Arc<KvNode>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let argv = match parse_argv(frame) {
            Ok(Some(argv)) => argv,
            Ok(None) => continue,
            Err(err) => {
                framed
                    .send(BytesFrame::Error(format!("ERR {err}").into()))
                    .await?;
                continue;
            }
        };

        if argv[0].eq_ignore_ascii_case(b"QUIT") {
            framed
                .send(BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")))
                .await?;
            return Ok(());
        }

        let reply = dispatch(&node, argv).await;
        framed.send(reply).await?;
    }
    Ok(())
}

async fn dispatch(node: &Arc<KvNode>, argv: Vec<Vec<u8>>) -> BytesFrame {
    let name = argv[0].to_ascii_uppercase();
    let result: Result<BytesFrame> = match name.as_slice() {
        b"PING" => Ok(BytesFrame::SimpleString(bytes::Bytes::from_static(b"PONG"))),
        b"STATS" => stats_frame(node),
        b"GET" => {
            if argv.len() != 2 {
                Err(StoreError::InvalidArgs)
            } else {
                node.get(&argv[1]).map(opt_bulk)
            }
        }
        b"MGET" => {
            if argv.len() < 2 {
                Err(StoreError::InvalidArgs)
            } else {
                node.mget(&argv[1..]).map(|values| {
                    BytesFrame::Array(values.into_iter().map(opt_bulk).collect())
                })
            }
        }
        b"EXISTS" => {
            if argv.len() < 2 {
                Err(StoreError::InvalidArgs)
            } else {
                node.exists(&argv[1..]).map(BytesFrame::Integer)
            }
        }
        b"STRLEN" => {
            if argv.len() != 2 {
                Err(StoreError::InvalidArgs)
            } else {
                node.str_len(&argv[1]).map(BytesFrame::Integer)
            }
        }
        b"GETBIT" => {
            if argv.len() != 3 {
                Err(StoreError::InvalidArgs)
            } else {
                match parse_i64(&argv[2]) {
                    Ok(offset) => node.get_bit(&argv[1], offset).map(BytesFrame::Integer),
                    Err(()) => Err(StoreError::InvalidArgs),
                }
            }
        }
        _ => {
            let is_set = name == b"SET";
            node.propose(argv).await.map(|value| value_frame(value, is_set))
        }
    };

    match result {
        Ok(frame) => frame,
        Err(StoreError::NotLeader) => {
            let master = node.current_master();
            if master.is_empty() {
                BytesFrame::Error(format!("ERR {}", StoreError::NotLeader).into())
            } else {
                BytesFrame::Error(format!("ERR {} (current: {master})", StoreError::NotLeader).into())
            }
        }
        Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
    }
}

fn stats_frame(node: &Arc<KvNode>) -> Result<BytesFrame> {
    let stats = node.stats()?;
    let msg = format!(
        "first_index={} last_index={} num_entries={} applied_index={} term={} is_leader={} log_size={} data_size={} key_count={}",
        stats.first_index,
        stats.last_index,
        stats.num_entries,
        stats.applied_index,
        stats.term,
        stats.is_leader,
        stats.log_size,
        stats.data_size,
        stats.key_count,
    );
    Ok(BytesFrame::BulkString(bytes::Bytes::from(msg.into_bytes())))
}

fn opt_bulk(value: Option<Vec<u8>>) -> BytesFrame {
    match value {
        None => BytesFrame::Null,
        Some(bytes) => BytesFrame::BulkString(bytes::Bytes::from(bytes)),
    }
}

fn value_frame(value: Value, is_set: bool) -> BytesFrame {
    match value {
        Value::Ok => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
        // SET reports 1/0 from the applier; the wire reply is OK or null.
        Value::Int(0) if is_set => BytesFrame::Null,
        Value::Int(_) if is_set => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
        Value::Int(n) => BytesFrame::Integer(n),
        Value::Bytes(bytes) => BytesFrame::BulkString(bytes::Bytes::from(bytes)),
        Value::Null => BytesFrame::Null,
    }
}

fn parse_argv(frame: BytesFrame) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let mut argv = Vec::with_capacity(parts.len());
    for part in &parts {
        let bytes = frame_bytes(part).ok_or_else(|| anyhow::anyhow!("invalid argument frame"))?;
        argv.push(bytes);
    }
    Ok(Some(argv))
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}
