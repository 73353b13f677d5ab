use clap::Parser;
use sctp_channel::{
    ChannelError, HandlerResult, LoopbackTransport, MessageInfo, NativeTransport, Notification, SctpChannel,
    SctpServerChannel,
};
use std::sync::Arc;
use tracing_subscriber::filter::EnvFilter;

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

/// Echo every message back on the stream it came in on until the peer shuts down.
fn echo(channel: SctpChannel) -> Result<(), ChannelError> {
    let mut on_notification = |n: &Notification, finished: &mut bool| {
        if let Notification::Shutdown(_) = n {
            *finished = true;
        }
        HandlerResult::Return
    };
    let mut finished = false;
    let mut buf = Vec::new();
    while !finished {
        buf.clear();
        if let Some(msg) = channel.receive(&mut buf, &mut finished, Some(&mut on_notification))? {
            let reply = MessageInfo::new(None, msg.stream()).with_payload_protocol_id(msg.payload_protocol_id());
            channel.send(&buf, &reply)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), ChannelError> {
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());

    let server = SctpServerChannel::open(transport.clone())?;
    server.bind(Some("127.0.0.1:0".parse().expect("valid address")), 0)?;
    let addr = server.local_addresses()?[0];
    let echoer = std::thread::spawn(move || -> Result<(), ChannelError> {
        if let Some(channel) = server.accept()? {
            println!("Accepted {:?}", channel.association()?);
            echo(channel)?;
        }
        Ok(())
    });

    println!("Starting SctpChannel client");
    let channel = SctpChannel::open(transport)?;
    channel.connect(addr)?;
    let association = channel.association()?.expect("connected channel has an association");
    println!("Connected successfully: {association}");

    let mut buf = vec![0u8; args.size];
    let mut reply = Vec::new();
    for i in 0..args.count {
        buf.fill(i as u8);
        let stream = (i as u16) % association.max_outbound_streams();
        let n = channel.send(&buf, &MessageInfo::for_association(&association, stream).with_payload_protocol_id(i))?;
        reply.clear();
        if let Some(msg) = channel.receive(&mut reply, &mut (), None)? {
            println!(
                "Wrote {n} bytes on stream {stream}, got {} back on stream {} (ppid {})",
                msg.bytes(),
                msg.stream(),
                msg.payload_protocol_id()
            );
        }
    }

    channel.shutdown()?;
    channel.close()?;
    drop(channel);
    let _ = echoer.join();
    Ok(())
}

/// A simple client illustrating a single-association channel.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The number of messages to send
    #[arg(short, long, default_value = "8")]
    count: u32,
    /// The message size
    #[arg(short, long, default_value = "64")]
    size: usize,
}
