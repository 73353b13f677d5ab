use sctp_channel::{
    AssocChangeEvent, ChannelError, HandlerResult, LoopbackTransport, MessageInfo, NativeTransport, Notification,
    SctpChannel, SctpMultiChannel,
};
use std::sync::Arc;
use tracing::info;
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

/// Counts associations that came up and went away.
#[derive(Default, Debug)]
struct Tally {
    up: usize,
    gone: usize,
}

fn print_notification(notification: &Notification, tally: &mut Tally) -> HandlerResult {
    match notification {
        Notification::AssociationChange(change) => {
            println!("Association {:?}: {:?}", change.association().map(|a| a.id()), change.event());
            match change.event() {
                AssocChangeEvent::CommUp => tally.up += 1,
                AssocChangeEvent::CommLost | AssocChangeEvent::Shutdown => tally.gone += 1,
                _ => {}
            }
        }
        Notification::Shutdown(shutdown) => {
            println!("Peer shut down {:?}", shutdown.association().map(|a| a.id()));
            tally.gone += 1;
        }
        other => println!("Notification: {other:?}"),
    }
    HandlerResult::Continue
}

fn main() -> Result<(), ChannelError> {
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
    let server = SctpMultiChannel::open(transport.clone())?;
    server.bind(Some("127.0.0.1:7890".parse().expect("valid address")), 0)?;
    println!("Multiplexed server listening on {:?}", server.local_addresses()?);

    let clients: Vec<_> = (0..3)
        .map(|i| {
            let transport = transport.clone();
            std::thread::spawn(move || -> Result<(), ChannelError> {
                let channel = SctpChannel::open(transport)?;
                channel.connect("127.0.0.1:7890".parse().expect("valid address"))?;
                let text = format!("Hello from client {i}");
                channel.send(text.as_bytes(), &MessageInfo::new(None, i).with_payload_protocol_id(51))?;
                channel.shutdown()
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client thread panicked")?;
    }

    let mut handler = print_notification;
    let mut tally = Tally::default();
    let mut buf = Vec::new();
    while tally.gone < 3 {
        buf.clear();
        if let Some(msg) = server.receive(&mut buf, &mut tally, Some(&mut handler))? {
            info!("{} bytes on stream {}", msg.bytes(), msg.stream());
            println!(
                "[{:?}] {}",
                msg.association().map(|a| a.id()),
                String::from_utf8_lossy(&buf)
            );
        }
    }
    println!("{tally:?}, still registered: {:?}", server.associations()?);
    Ok(())
}
