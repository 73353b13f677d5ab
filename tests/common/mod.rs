#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sctp_channel::{
    HandlerResult, LoopbackTransport, MessageInfo, NativeTransport, Notification, SctpChannel, SctpMultiChannel,
    SctpServerChannel,
};

/// A loopback fabric, both as the concrete type (for its test hooks) and as
/// the trait object the channels take.
pub fn loopback() -> (LoopbackTransport, Arc<dyn NativeTransport>) {
    let transport = LoopbackTransport::new();
    let shared: Arc<dyn NativeTransport> = Arc::new(transport.clone());
    (transport, shared)
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn listening_multi(transport: &Arc<dyn NativeTransport>) -> (SctpMultiChannel, SocketAddr) {
    let multi = SctpMultiChannel::open(transport.clone()).unwrap();
    multi.bind(Some(localhost()), 0).unwrap();
    let addr = multi.local_addresses().unwrap()[0];
    (multi, addr)
}

/// A client channel and the channel the server accepted for it.
pub fn connected_pair(transport: &Arc<dyn NativeTransport>) -> (SctpChannel, SctpChannel) {
    let server = SctpServerChannel::open(transport.clone()).unwrap();
    server.bind(Some(localhost()), 0).unwrap();
    let addr = server.local_addresses().unwrap()[0];
    let client = SctpChannel::open(transport.clone()).unwrap();
    assert!(client.connect(addr).unwrap());
    let accepted = server.accept().unwrap().unwrap();
    (client, accepted)
}

/// Handler that records every notification and keeps receiving.
pub fn record(n: &Notification, seen: &mut Vec<Notification>) -> HandlerResult {
    seen.push(n.clone());
    HandlerResult::Continue
}

/// Handler that records every notification and returns from receive.
pub fn record_and_return(n: &Notification, seen: &mut Vec<Notification>) -> HandlerResult {
    seen.push(n.clone());
    HandlerResult::Return
}

/// Block until the next data message, recording notifications on the way.
pub fn next_message(channel: &SctpMultiChannel, buf: &mut Vec<u8>, seen: &mut Vec<Notification>) -> MessageInfo {
    let mut handler = record;
    loop {
        if let Some(info) = channel.receive(buf, seen, Some(&mut handler)).unwrap() {
            return info;
        }
    }
}

/// Poll `cond` until it holds or five seconds passed.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
