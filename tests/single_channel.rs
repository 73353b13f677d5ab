mod common;

use std::net::{IpAddr, SocketAddr};

use common::{connected_pair, localhost, loopback, record_and_return};
use sctp_channel::{
    AssocChangeEvent, ChannelConfig, ChannelError, HandlerResult, InitMaxStreams, MessageInfo, Notification,
    NotificationHandler, OptionName, SctpChannel, SctpMultiChannel, SctpServerChannel, SocketOption, MAX_LINGER,
};

#[test]
fn test_second_bind_fails_on_every_flavor() {
    let (_, transport) = loopback();

    let channel = SctpChannel::open(transport.clone()).unwrap();
    channel.bind(None).unwrap();
    assert!(matches!(channel.bind(None), Err(ChannelError::AlreadyBound)));
    assert!(matches!(channel.bind(Some(localhost())), Err(ChannelError::AlreadyBound)));

    let server = SctpServerChannel::open(transport.clone()).unwrap();
    server.bind(Some(localhost()), 0).unwrap();
    assert!(matches!(server.bind(Some(localhost()), 0), Err(ChannelError::AlreadyBound)));

    let multi = SctpMultiChannel::open(transport).unwrap();
    multi.bind(None, -1).unwrap();
    assert!(matches!(multi.bind(None, 5), Err(ChannelError::AlreadyBound)));
}

#[test]
fn test_bind_rejected_once_connected() {
    let (_, transport) = loopback();
    let (client, _accepted) = connected_pair(&transport);
    assert!(matches!(client.bind(None), Err(ChannelError::AlreadyConnected)));
}

#[test]
fn test_connect_and_exchange() {
    let (_, transport) = loopback();
    let (client, accepted) = connected_pair(&transport);

    let association = client.association().unwrap().unwrap();
    assert_eq!(association.max_outbound_streams(), 10);
    assert!(accepted.association().unwrap().is_some());
    assert_eq!(client.remote_addresses().unwrap(), accepted.local_addresses().unwrap());

    let info = MessageInfo::new(None, 3).with_payload_protocol_id(77);
    assert_eq!(client.send(b"ping", &info).unwrap(), 4);

    let mut buf = Vec::<u8>::new();
    let got = accepted.receive(&mut buf, &mut (), None).unwrap().unwrap();
    assert_eq!(&buf[..], b"ping");
    assert_eq!(got.stream(), 3);
    assert!(!got.is_unordered());
    assert_eq!(got.payload_protocol_id(), 77);
    assert!(got.is_complete());
    assert_eq!(got.bytes(), 4);
    assert_eq!(got.association().copied(), accepted.association().unwrap());

    let reply = MessageInfo::new(None, 9).with_unordered(true).with_payload_protocol_id(5);
    accepted.send(b"pong", &reply).unwrap();
    buf.clear();
    let got = client.receive(&mut buf, &mut (), None).unwrap().unwrap();
    assert_eq!(&buf[..], b"pong");
    assert_eq!(got.stream(), 9);
    assert!(got.is_unordered());
    assert_eq!(got.payload_protocol_id(), 5);
    assert_eq!(got.association(), Some(&association));
}

#[test]
fn test_stream_outside_negotiated_range() {
    let (_, transport) = loopback();
    let server = SctpServerChannel::open(transport.clone()).unwrap();
    server
        .set_option(SocketOption::InitMaxStreams(InitMaxStreams::new(4, 4)))
        .unwrap();
    server.bind(Some(localhost()), 0).unwrap();
    let addr = server.local_addresses().unwrap()[0];

    let client = SctpChannel::open(transport).unwrap();
    client.connect(addr).unwrap();
    let association = client.association().unwrap().unwrap();
    assert_eq!(association.max_outbound_streams(), 4);

    let err = client.send(b"x", &MessageInfo::new(None, 4)).unwrap_err();
    assert!(matches!(err, ChannelError::InvalidStream { stream: 4, max_outbound: 4 }));
    assert!(client.send(b"x", &MessageInfo::new(None, 3)).is_ok());
}

#[test]
fn test_foreign_association_not_owned() {
    let (_, transport) = loopback();
    let (first, _a) = connected_pair(&transport);
    let (second, _b) = connected_pair(&transport);
    let foreign = second.association().unwrap().unwrap();

    let err = first
        .send(b"x", &MessageInfo::for_association(&foreign, 0))
        .unwrap_err();
    assert!(matches!(err, ChannelError::NotOwned(id) if id == foreign.id()));
}

#[test]
fn test_preferred_address_must_be_a_peer_address() {
    let (_, transport) = loopback();
    let (client, _accepted) = connected_pair(&transport);
    let stranger: SocketAddr = "127.0.0.9:9".parse().unwrap();
    let err = client
        .send(b"x", &MessageInfo::new(Some(stranger), 0))
        .unwrap_err();
    assert!(matches!(err, ChannelError::AddressNotOwned { address, .. } if address == stranger));
}

#[test]
fn test_shutdown_twice_is_a_noop() {
    let (_, transport) = loopback();
    let (client, accepted) = connected_pair(&transport);

    client.shutdown().unwrap();
    client.shutdown().unwrap();
    assert!(matches!(
        client.send(b"late", &MessageInfo::new(None, 0)),
        Err(ChannelError::Shutdown)
    ));

    let mut seen: Vec<Notification> = Vec::new();
    let mut handler = record_and_return;
    let mut buf = Vec::<u8>::new();
    assert!(accepted.receive(&mut buf, &mut seen, Some(&mut handler)).unwrap().is_none());
    // The peer is gone: further receives see the end of the association.
    assert!(accepted.receive(&mut buf, &mut seen, Some(&mut handler)).unwrap().is_none());
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Notification::Shutdown(_)));

    // The local side observes its own shutdown completing.
    let mut local: Vec<Notification> = Vec::new();
    assert!(client.receive(&mut buf, &mut local, Some(&mut handler)).unwrap().is_none());
    assert!(matches!(
        &local[..],
        [Notification::AssociationChange(change)] if change.event() == AssocChangeEvent::Shutdown
    ));
}

#[test]
fn test_state_preconditions() {
    let (_, transport) = loopback();
    let channel = SctpChannel::open(transport.clone()).unwrap();
    let mut buf = Vec::<u8>::new();

    assert!(matches!(
        channel.receive(&mut buf, &mut (), None),
        Err(ChannelError::NotYetConnected)
    ));
    assert!(matches!(
        channel.send(b"x", &MessageInfo::new(None, 0)),
        Err(ChannelError::NotYetConnected)
    ));
    assert!(matches!(channel.finish_connect(), Err(ChannelError::NoConnectionPending)));
    assert!(matches!(channel.shutdown(), Err(ChannelError::NotYetConnected)));
    assert!(matches!(
        channel.send(b"", &MessageInfo::new(None, 0)),
        Err(ChannelError::InvalidArgument(_))
    ));

    let unresolved: SocketAddr = "0.0.0.0:7000".parse().unwrap();
    assert!(matches!(channel.connect(unresolved), Err(ChannelError::UnresolvedAddress(_))));

    let (client, _accepted) = connected_pair(&transport);
    let addr = client.remote_addresses().unwrap()[0];
    assert!(matches!(client.connect(addr), Err(ChannelError::AlreadyConnected)));
    assert!(client.finish_connect().unwrap());

    client.close().unwrap();
    client.close().unwrap();
    assert!(!client.is_open());
    assert!(matches!(client.association(), Err(ChannelError::Closed)));
    assert!(matches!(
        client.send(b"x", &MessageInfo::new(None, 0)),
        Err(ChannelError::Closed)
    ));
}

#[test]
fn test_non_blocking_connect() {
    let (_, transport) = loopback();
    let server = SctpServerChannel::open(transport.clone()).unwrap();
    server.bind(Some(localhost()), 0).unwrap();
    let addr = server.local_addresses().unwrap()[0];

    let client = SctpChannel::open(transport).unwrap();
    client.configure_blocking(false).unwrap();
    assert!(!client.is_blocking());
    assert!(!client.connect(addr).unwrap());
    assert!(client.is_connection_pending());
    assert!(matches!(client.connect(addr), Err(ChannelError::ConnectionPending)));
    assert!(matches!(client.bind(None), Err(ChannelError::ConnectionPending)));

    assert!(client.finish_connect().unwrap());
    assert!(!client.is_connection_pending());
    assert!(client.association().unwrap().is_some());

    // Nothing queued: a non-blocking receive comes back empty.
    let mut buf = Vec::<u8>::new();
    assert!(client.receive(&mut buf, &mut (), None).unwrap().is_none());
}

#[test]
fn test_failed_connect_closes_channel() {
    let (_, transport) = loopback();
    let channel = SctpChannel::open(transport).unwrap();
    let nowhere: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(matches!(channel.connect(nowhere), Err(ChannelError::Io(_))));
    assert!(!channel.is_open());
}

#[test]
fn test_large_message_delivered_in_parts() {
    let (_, transport) = loopback();
    let server = SctpServerChannel::open_with_config(transport.clone(), ChannelConfig::new().max_receive_size(4)).unwrap();
    server.bind(Some(localhost()), 0).unwrap();
    let addr = server.local_addresses().unwrap()[0];
    let client = SctpChannel::open(transport).unwrap();
    client.connect(addr).unwrap();
    let accepted = server.accept().unwrap().unwrap();

    client.send(b"0123456789", &MessageInfo::new(None, 1)).unwrap();

    let mut buf = Vec::<u8>::new();
    let mut parts = Vec::new();
    loop {
        let info = accepted.receive(&mut buf, &mut (), None).unwrap().unwrap();
        parts.push((info.bytes(), info.is_complete()));
        if info.is_complete() {
            break;
        }
    }
    assert_eq!(parts, vec![(4, false), (4, false), (2, true)]);
    assert_eq!(&buf[..], b"0123456789");
}

#[test]
fn test_full_buffer_rejected() {
    let (_, transport) = loopback();
    let (client, _accepted) = connected_pair(&transport);
    let mut storage = [0u8; 0];
    let mut full = &mut storage[..];
    assert!(matches!(
        client.receive(&mut full, &mut (), None),
        Err(ChannelError::BufferFull)
    ));
}

#[test]
fn test_remote_addresses_survive_abort() {
    let (_, transport) = loopback();
    let (client, accepted) = connected_pair(&transport);
    let known = client.remote_addresses().unwrap();
    assert!(!known.is_empty());

    accepted.set_option(SocketOption::Linger(0)).unwrap();
    accepted.close().unwrap();

    let mut seen: Vec<Notification> = Vec::new();
    let mut handler = record_and_return;
    let mut buf = Vec::<u8>::new();
    assert!(client.receive(&mut buf, &mut seen, Some(&mut handler)).unwrap().is_none());
    assert!(matches!(
        &seen[..],
        [Notification::AssociationChange(change)] if change.event() == AssocChangeEvent::CommLost
    ));
    assert_eq!(client.remote_addresses().unwrap(), known);
}

#[test]
fn test_handler_cannot_reenter_receive() {
    let (_, transport) = loopback();
    let (client, accepted) = connected_pair(&transport);
    client.shutdown().unwrap();

    let mut outcome: Option<bool> = None;
    let mut handler = |_: &Notification, outcome: &mut Option<bool>| {
        let nested = accepted.receive(&mut Vec::<u8>::new(), &mut (), None);
        *outcome = Some(matches!(nested, Err(ChannelError::ReentrantReceive)));
        HandlerResult::Return
    };
    let dyn_handler: &mut dyn NotificationHandler<Option<bool>> = &mut handler;
    let mut buf = Vec::<u8>::new();
    assert!(accepted.receive(&mut buf, &mut outcome, Some(dyn_handler)).unwrap().is_none());
    assert_eq!(outcome, Some(true));

    // The session ended with the outer call; receiving works again.
    assert!(accepted.receive(&mut buf, &mut (), None).unwrap().is_none());
}

#[test]
fn test_local_address_management() {
    let (_, transport) = loopback();

    let wildcard = SctpChannel::open(transport.clone()).unwrap();
    let extra: IpAddr = "127.0.0.2".parse().unwrap();
    assert!(matches!(wildcard.bind_address(extra), Err(ChannelError::NotYetBound)));
    wildcard.bind(None).unwrap();
    assert!(matches!(wildcard.bind_address(extra), Err(ChannelError::WildcardBound)));

    let channel = SctpChannel::open(transport).unwrap();
    channel.bind(Some(localhost())).unwrap();
    let port = channel.local_addresses().unwrap()[0].port();
    assert_ne!(port, 0);

    channel.bind_address(extra).unwrap();
    assert!(matches!(channel.bind_address(extra), Err(ChannelError::AlreadyBound)));
    assert_eq!(channel.local_addresses().unwrap().len(), 2);
    assert!(channel.local_addresses().unwrap().iter().all(|a| a.port() == port));

    let absent: IpAddr = "127.0.0.3".parse().unwrap();
    assert!(matches!(channel.unbind_address(absent), Err(ChannelError::IllegalUnbind { .. })));
    channel.unbind_address(extra).unwrap();
    let last: IpAddr = "127.0.0.1".parse().unwrap();
    assert!(matches!(
        channel.unbind_address(last),
        Err(ChannelError::IllegalUnbind { reason: "cannot unbind the last address", .. })
    ));
}

#[test]
fn test_options_are_validated_and_forwarded() {
    let (_, transport) = loopback();
    let channel = SctpChannel::open(transport.clone()).unwrap();

    channel.set_option(SocketOption::Linger(100_000)).unwrap();
    assert_eq!(channel.get_option(OptionName::Linger).unwrap(), SocketOption::Linger(MAX_LINGER));
    channel.set_option(SocketOption::NoDelay(true)).unwrap();
    assert_eq!(channel.get_option(OptionName::NoDelay).unwrap(), SocketOption::NoDelay(true));

    assert!(matches!(
        channel.set_option(SocketOption::FragmentInterleave(3)),
        Err(ChannelError::InvalidOption { .. })
    ));
    assert!(matches!(
        channel.get_option(OptionName::SetPeerPrimaryAddress),
        Err(ChannelError::InvalidOption { .. })
    ));
    assert!(matches!(
        channel.get_option(OptionName::PrimaryAddress),
        Err(ChannelError::NotYetConnected)
    ));

    let (client, _accepted) = connected_pair(&transport);
    let peer = client.remote_addresses().unwrap()[0];
    assert_eq!(
        client.get_option(OptionName::PrimaryAddress).unwrap(),
        SocketOption::PrimaryAddress(peer)
    );
}
