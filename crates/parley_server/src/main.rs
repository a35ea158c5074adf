#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::sync::Arc;

use parley_protocol::codec::{self, DEFAULT_MAX_LINE_SIZE};
use parley_protocol::{ClientEvent, ServerEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::coordinator::Coordinator;
use crate::server::dispatcher::{SessionControl, SessionDriver};
use crate::server::identity::IdentityProvider;
use crate::server::store::sql::SqliteStore;
use crate::server::store::{ChatStore, MemoryStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:9090)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = crate::config::default_config_path()?;
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = bind_override {
		server_cfg.bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.metrics_bind.as_deref());

	let (store, identity): (Arc<dyn ChatStore>, Arc<dyn IdentityProvider>) = match server_cfg.database_url.as_deref() {
		Some(url) => {
			let store = Arc::new(SqliteStore::connect(url).await.map_err(|e| anyhow::anyhow!("{e}"))?);
			info!("persistence: sqlite store connected");
			(store.clone(), store)
		}
		None => {
			let store = Arc::new(MemoryStore::new());
			warn!("persistence: no database_url configured; state is in-memory and non-durable");
			(store.clone(), store)
		}
	};

	let coordinator = Coordinator::new(store, identity, server_cfg.coordinator_settings());
	coordinator.ensure_default_channel().await;

	let listener = TcpListener::bind(&server_cfg.bind).await?;
	info!(bind = %server_cfg.bind, "parley_server listening");

	let outbox_capacity = server_cfg.outbox_capacity;
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);
		info!(conn_id, %remote, "accepted connection");

		let coordinator = Arc::clone(&coordinator);
		tokio::spawn(async move {
			handle_connection(coordinator, conn_id, stream, outbox_capacity).await;
		});
	}
}

async fn handle_connection(coordinator: Arc<Coordinator>, conn_id: u64, stream: TcpStream, outbox_capacity: usize) {
	let (reader, writer) = stream.into_split();
	let (outbox_tx, outbox_rx) = mpsc::channel::<ServerEvent>(outbox_capacity);

	let write_task = tokio::spawn(write_loop(conn_id, writer, outbox_rx));

	let mut driver = SessionDriver::new(coordinator, conn_id, outbox_tx);
	let mut reader = BufReader::new(reader).take(0);
	let mut buf = Vec::new();

	loop {
		match read_frame(&mut reader, &mut buf, DEFAULT_MAX_LINE_SIZE).await {
			Ok(FrameRead::Line) => {}
			Ok(FrameRead::Eof) => break,
			Ok(FrameRead::Oversized) => {
				debug!(conn_id, max = DEFAULT_MAX_LINE_SIZE, "line exceeds size cap; closing");
				break;
			}
			Err(e) => {
				debug!(conn_id, error = %e, "read failed");
				break;
			}
		}

		let line = trim_frame(&buf);
		if line.is_empty() {
			continue;
		}

		let event: ClientEvent = match codec::decode_line(line, DEFAULT_MAX_LINE_SIZE) {
			Ok(event) => event,
			Err(e) => {
				// Unparseable input is a protocol violation, not a user error.
				debug!(conn_id, error = %e, "malformed client event; closing");
				break;
			}
		};

		if driver.handle(event).await == SessionControl::Close {
			break;
		}
	}

	driver.close().await;
	// Dropping the driver closes the outbox, which lets the writer drain and
	// exit.
	drop(driver);
	let _ = write_task.await;
	debug!(conn_id, "connection done");
}

#[derive(Debug, PartialEq, Eq)]
enum FrameRead {
	Line,
	Oversized,
	Eof,
}

/// Read one newline-delimited frame into `buf`, never buffering more than
/// `max + 1` bytes. A client streaming an endless line hits `Oversized`
/// instead of growing the buffer without bound.
async fn read_frame<R: AsyncBufRead + Unpin>(
	reader: &mut Take<R>,
	buf: &mut Vec<u8>,
	max: usize,
) -> std::io::Result<FrameRead> {
	buf.clear();
	reader.set_limit(max as u64 + 1);

	let n = reader.read_until(b'\n', buf).await?;
	if n == 0 {
		return Ok(FrameRead::Eof);
	}
	if buf.last() != Some(&b'\n') && n > max {
		return Ok(FrameRead::Oversized);
	}
	Ok(FrameRead::Line)
}

fn trim_frame(mut frame: &[u8]) -> &[u8] {
	while let Some((last, rest)) = frame.split_last() {
		if last.is_ascii_whitespace() {
			frame = rest;
		} else {
			break;
		}
	}
	frame
}

async fn write_loop(conn_id: u64, mut writer: OwnedWriteHalf, mut outbox_rx: mpsc::Receiver<ServerEvent>) {
	while let Some(event) = outbox_rx.recv().await {
		let line = match codec::encode_line(&event, DEFAULT_MAX_LINE_SIZE) {
			Ok(line) => line,
			Err(e) => {
				warn!(conn_id, error = %e, "failed to encode server event; skipping");
				continue;
			}
		};
		if writer.write_all(&line).await.is_err() {
			break;
		}

		// A terminal event ends the session; close the transport after it is
		// on the wire.
		if event.is_terminal() {
			let _ = writer.shutdown().await;
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frames_within_the_cap_pass_through() {
		let input: &[u8] = b"{\"a\":1}\n  \n{\"b\":2}";
		let mut reader = BufReader::new(input).take(0);
		let mut buf = Vec::new();

		assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Line);
		assert_eq!(trim_frame(&buf), b"{\"a\":1}");

		// Blank frame trims to nothing.
		assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Line);
		assert!(trim_frame(&buf).is_empty());

		// Final frame without a trailing newline is still a line.
		assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Line);
		assert_eq!(trim_frame(&buf), b"{\"b\":2}");

		assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Eof);
	}

	#[tokio::test]
	async fn endless_line_is_cut_off_at_the_cap() {
		let input = vec![b'a'; 1024];
		let mut reader = BufReader::new(&input[..]).take(0);
		let mut buf = Vec::new();

		assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), FrameRead::Oversized);
		assert_eq!(buf.len(), 17);
	}

	#[tokio::test]
	async fn line_of_exactly_the_cap_is_accepted() {
		let mut input = vec![b'a'; 16];
		input.push(b'\n');
		let mut reader = BufReader::new(&input[..]).take(0);
		let mut buf = Vec::new();

		assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), FrameRead::Line);
		assert_eq!(trim_frame(&buf).len(), 16);
	}
}
