//! Extend messaging demo binary.
//!
//! Starts an acceptor and an initiator peer linked in-process, opens an echo
//! channel between them and drives concurrent request traffic through the
//! full encode, frame and decode path.

use clap::Parser;
use extend_messaging::{Peer, Subject};
use extend_wire::{CborSerializer, NativeSerializer, Serializer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod echo;
mod logging;

use config::{ExtendConfig, SerializerKind};
use echo::{echo_factory, EchoReceiver, EchoRequest, ECHO_PROTOCOL, ECHO_RECEIVER};
use logging::RedbLogFormatter;

/// Extend messaging demo
#[derive(Parser, Debug)]
#[command(name = "extend", version, about = "Multiplexed request/response messaging demo")]
struct Args {
    /// Path to the shared configuration file
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Service name announced by the acceptor
    #[arg(long)]
    service_name: Option<String>,

    /// Number of echo requests to send
    #[arg(long)]
    requests: Option<usize>,

    /// Number of client threads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Request timeout, e.g. 5s; 0s waits forever
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Echo payload size in bytes
    #[arg(long, default_value = "64")]
    payload_size: usize,
}

impl Args {
    fn apply(&self, config: &mut ExtendConfig) {
        if let Some(name) = &self.service_name {
            config.service_name = name.clone();
        }
        if let Some(requests) = self.requests {
            config.requests = requests;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout_ms = Duration::from(timeout).as_millis() as u64;
        }
    }
}

#[derive(Debug, Default)]
struct RunSummary {
    succeeded: u64,
    failed: u64,
    elapsed: Duration,
}

fn run(config: ExtendConfig, payload_size: usize) -> anyhow::Result<RunSummary> {
    let serializer: Arc<dyn Serializer> = match config.serializer {
        SerializerKind::Native => Arc::new(NativeSerializer),
        SerializerKind::Cbor => Arc::new(CborSerializer),
    };

    let receiver = Arc::new(EchoReceiver::default());
    let acceptor = Peer::with_serializer(config.peer_config(&config.service_name), serializer.clone());
    acceptor.register_protocol(echo_factory());
    acceptor.register_receiver(receiver.clone());
    acceptor.start()?;

    let initiator = Peer::with_serializer(config.peer_config("ExtendClient"), serializer);
    initiator.register_protocol(echo_factory());
    initiator.start()?;

    let connection = initiator.connect(&acceptor)?;
    initiator.ping(&connection)?;
    let channel = connection.open_channel(ECHO_PROTOCOL, Some(ECHO_RECEIVER), None, Some(Subject::new("demo")))?;
    info!("Opened {}", channel);

    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let payload = "x".repeat(payload_size);
    let threads = config.concurrency.max(1);
    let per_thread = config.requests.div_ceil(threads);
    let started = Instant::now();

    std::thread::scope(|scope| {
        for t in 0..threads {
            let channel = channel.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();
            let payload = payload.clone();
            let count = per_thread.min(config.requests.saturating_sub(t * per_thread));
            scope.spawn(move || {
                for _ in 0..count {
                    match channel.request(Box::new(EchoRequest::new(payload.as_str())), None) {
                        Ok(result) if result.as_str() == Some(payload.as_str()) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(result) => {
                            warn!("Echo returned unexpected result {}", result);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("Echo request failed: {}", e);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    let summary = RunSummary {
        succeeded: succeeded.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    };

    channel.close(true, None)?;
    let stats = initiator.stats();
    info!(
        "Initiator sent {} frames ({} bytes), received {} frames ({} bytes); acceptor served {} requests",
        stats.frames_sent,
        stats.bytes_sent,
        stats.frames_received,
        stats.bytes_received,
        receiver.served()
    );

    initiator.stop();
    acceptor.stop();
    Ok(summary)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("extend_wire={}", args.log_level).parse()?)
        .add_directive(format!("extend_messaging={}", args.log_level).parse()?)
        .add_directive(format!("redb_extend={}", args.log_level).parse()?);

    let formatter = RedbLogFormatter::new("extend".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting reDB Extend demo v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ExtendConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let payload_size = args.payload_size;
    let demo = tokio::task::spawn_blocking(move || run(config, payload_size));

    tokio::select! {
        result = demo => {
            let summary = result??;
            let rate = summary.succeeded as f64 / summary.elapsed.as_secs_f64().max(f64::EPSILON);
            info!(
                "Completed {} requests ({} failed) in {:?}, {:.0} req/s",
                summary.succeeded, summary.failed, summary.elapsed, rate
            );
            if summary.failed > 0 {
                anyhow::bail!("{} echo requests failed", summary.failed);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted before the demo run completed");
        }
    }

    info!("Extend demo shutdown complete");
    Ok(())
}
