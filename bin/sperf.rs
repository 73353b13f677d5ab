use clap::Parser;
use sctp_channel::{
    AssocChangeEvent, ChannelError, HandlerResult, LoopbackTransport, MessageInfo, NativeTransport, Notification,
    SctpChannel, SctpMultiChannel, SctpServerChannel,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;

struct Meter {
    start: Instant,
    total_recv: usize,
    sampling_period: Duration,
}

impl Meter {
    fn new(period: u64) -> Self {
        Meter {
            start: Instant::now(),
            total_recv: 0,
            sampling_period: Duration::from_secs(period),
        }
    }

    fn record(&mut self, tag: &str, n: usize) {
        self.total_recv += n;
        let delta = self.start.elapsed();
        if delta >= self.sampling_period {
            let throughput = ((self.total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
            println!("[{tag}]: {throughput} Mbps");
            self.start = Instant::now();
            self.total_recv = 0;
        }
    }
}

fn run_client(transport: Arc<dyn NativeTransport>, addr: SocketAddr, args: &Args) -> Result<(), ChannelError> {
    let channel = SctpChannel::open(transport)?;
    channel.connect(addr)?;
    let streams = channel
        .association()?
        .map(|a| a.max_outbound_streams().min(args.streams))
        .unwrap_or(1)
        .max(1);
    println!("Connected successfully to {addr} using {streams} streams");

    let buf = vec![42u8; args.size];
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut stream = 0;
    while deadline.is_none_or(|d| Instant::now() < d) {
        let n = channel.send(&buf, &MessageInfo::new(None, stream))?;
        if n == 0 {
            println!("Channel closed by remote peer");
            break;
        }
        stream = (stream + 1) % streams;
    }
    channel.close()
}

/// Stops the receive loop once the peer shut down or was lost.
fn watch_peer(n: &Notification, gone: &mut bool) -> HandlerResult {
    match n {
        Notification::Shutdown(_) => *gone = true,
        Notification::AssociationChange(change) if change.event() == AssocChangeEvent::CommLost => *gone = true,
        _ => return HandlerResult::Continue,
    }
    HandlerResult::Return
}

/// Receive on `channel` until the peer is gone or the channel closed.
fn drain_channel(channel: &SctpChannel, tag: &str, meter: &mut Meter, size: usize) {
    let mut buf = Vec::with_capacity(size);
    let mut gone = false;
    let mut handler = watch_peer;
    loop {
        buf.clear();
        match channel.receive(&mut buf, &mut gone, Some(&mut handler)) {
            Ok(Some(info)) => meter.record(tag, info.bytes()),
            Ok(None) if channel.is_open() && !gone => {}
            Ok(None) => break,
            Err(err) => {
                println!("Receive failed: {err}");
                break;
            }
        }
    }
}

fn run_server_channel(server: SctpServerChannel, args: &Args) -> Result<(), ChannelError> {
    let mut cid = 0;
    while let Some(channel) = server.accept()? {
        println!("Accepted association: {:?}", channel.association()?);
        let size = args.size;
        let period = args.period;
        let tag = format!("{cid}");
        cid += 1;
        std::thread::spawn(move || {
            let mut meter = Meter::new(period);
            drain_channel(&channel, &tag, &mut meter, size);
            if let Err(err) = channel.close() {
                println!("Close failed: {err}");
            }
        });
    }
    Ok(())
}

fn run_multi_channel(server: SctpMultiChannel, args: &Args) -> Result<(), ChannelError> {
    let mut meter = Meter::new(args.period);
    let mut buf = Vec::with_capacity(args.size);
    loop {
        buf.clear();
        match server.receive(&mut buf, &mut (), None)? {
            Some(info) => {
                let tag = info.association().map(|a| a.id().to_string()).unwrap_or_default();
                meter.record(&tag, info.bytes());
            }
            None if server.is_open() => {}
            None => return Ok(()),
        }
    }
}

fn run(args: Args) -> Result<(), ChannelError> {
    let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
    let local: SocketAddr = "127.0.0.1:0".parse().map_err(|_| ChannelError::InvalidArgument("bad address"))?;

    let (addr, server) = if args.multi {
        let server = SctpMultiChannel::open(transport.clone())?;
        server.bind(Some(local), 0)?;
        let addr = server.local_addresses()?[0];
        let server_args = args.clone();
        (addr, std::thread::spawn(move || run_multi_channel(server, &server_args)))
    } else {
        let server = SctpServerChannel::open(transport.clone())?;
        server.bind(Some(local), 0)?;
        let addr = server.local_addresses()?[0];
        let server_args = args.clone();
        (addr, std::thread::spawn(move || run_server_channel(server, &server_args)))
    };
    println!("Listening on {addr}");

    run_client(transport, addr, &args)?;
    drop(server);
    Ok(())
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if let Err(err) = run(args) {
        println!("sperf failed: {err}");
        std::process::exit(1);
    }
}

/// The performance benchmarking application for SCTP channels over the
/// loopback transport
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    /// Receive on a multiplexed channel instead of accepted channels
    #[arg(short, long)]
    multi: bool,
    /// The message size
    #[arg(short, long, default_value = "8192")]
    size: usize,
    /// The number of streams to spread messages over
    #[arg(long, default_value = "4")]
    streams: u16,
    /// How long the client sends, in seconds (0 runs forever)
    #[arg(short, long, default_value = "10")]
    duration: u64,
    /// The sampling period
    #[arg(short, long, default_value = "1")]
    period: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_drain_stops_when_peer_leaves() {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let server = SctpServerChannel::open(transport.clone()).unwrap();
        server.bind(Some("127.0.0.1:0".parse().unwrap()), 0).unwrap();
        let client = SctpChannel::open(transport).unwrap();
        client.connect(server.local_addresses().unwrap()[0]).unwrap();
        let accepted = server.accept().unwrap().unwrap();

        client.send(&[1u8; 100], &MessageInfo::new(None, 0)).unwrap();
        client.close().unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut meter = Meter::new(3600);
            drain_channel(&accepted, "0", &mut meter, 128);
            let _ = tx.send(meter.total_recv);
        });
        let received = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("receive loop did not stop after the peer left");
        assert_eq!(received, 100);
    }
}
