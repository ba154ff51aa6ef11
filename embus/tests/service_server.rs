mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use embus::core::Priority;
use embus::data_types::{ByteArray, Empty};
use embus::frame::DataSpecifier;
use embus::service::{
    Client, RegistrationError, RequestMeta, ResponseContext, Server, StartError,
};
use embus::time::Duration;

#[test]
fn test_suppressed_response_times_out() {
    let clock = TestClock::default();
    let a_out = Wire::default();
    let b_out = Wire::default();
    let node_a = test_node(SERVER_NODE, &a_out, &clock);
    let node_b = test_node(CLIENT_NODE, &b_out, &clock);

    let executed = AtomicUsize::new(0);
    let rejecting = |_meta: &RequestMeta,
                     request: &ByteArray,
                     response: &mut ResponseContext<ByteArray>| {
        executed.fetch_add(1, Ordering::Relaxed);
        response.response = request.clone();
        assert!(response.is_enabled());
        response.set_enabled(false);
        assert!(!response.is_enabled());
    };
    let mut server = Server::new(node_a.hub(), STRING_SERVICE);
    server.start(&rejecting).unwrap();

    let recorder: Recorder<ByteArray> = Recorder::default();
    let handler = |result| recorder.push(result);
    let mut client = Client::new(node_b.hub(), STRING_SERVICE, &handler).unwrap();
    client
        .set_request_timeout(Duration::from_millis(100))
        .unwrap();

    let request = ByteArray::from_slice(b"hello world").unwrap();
    client.call(SERVER_NODE, &request).unwrap();
    assert_eq!(
        node_b.listener_count(DataSpecifier::Response(STRING_SERVICE)),
        1
    );

    spin(&node_a, &a_out, &node_b, &b_out);

    // The server ran but put nothing on the bus: the call is still pending.
    assert_eq!(executed.load(Ordering::Relaxed), 1);
    assert!(client.has_pending_calls());

    clock.advance(Duration::from_millis(200));
    spin(&node_a, &a_out, &node_b, &b_out);

    assert!(!client.has_pending_calls());
    assert_eq!(
        node_b.listener_count(DataSpecifier::Response(STRING_SERVICE)),
        0
    );
    let last = recorder.last().unwrap();
    assert!(last.is_timeout());
    assert_eq!(last.call_id().server, SERVER_NODE);
}

#[test]
fn test_empty_service() {
    let clock = TestClock::default();
    let a_out = Wire::default();
    let b_out = Wire::default();
    let node_a = test_node(SERVER_NODE, &a_out, &clock);
    let node_b = test_node(CLIENT_NODE, &b_out, &clock);

    // Nothing to do - the service is empty.
    let noop = |_meta: &RequestMeta, _request: &Empty, _response: &mut ResponseContext<Empty>| {};
    let mut server = Server::new(node_a.hub(), EMPTY_SERVICE);
    server.start(&noop).unwrap();

    let recorder: Recorder<Empty> = Recorder::default();
    let handler = |result| recorder.push(result);
    let mut client = Client::new(node_b.hub(), EMPTY_SERVICE, &handler).unwrap();
    client.call(SERVER_NODE, &Empty {}).unwrap();

    spin(&node_a, &a_out, &node_b, &b_out);

    // The response is indistinguishable from a default-constructed one.
    let result = recorder.last().unwrap();
    assert_eq!(result.response(), Some(&Empty::default()));
    assert!(!client.has_pending_calls());
}

#[test]
fn test_start_stop_lifecycle() {
    let clock = TestClock::default();
    let a_out = Wire::default();
    let node_a = test_node(SERVER_NODE, &a_out, &clock);

    let noop =
        |_meta: &RequestMeta, _request: &ByteArray, _response: &mut ResponseContext<ByteArray>| {};

    let mut server = Server::new(node_a.hub(), STRING_SERVICE);
    assert!(!server.is_started());
    assert_eq!(
        node_a.listener_count(DataSpecifier::Request(STRING_SERVICE)),
        0
    );

    server.start(&noop).unwrap();
    assert!(server.is_started());
    assert_eq!(
        node_a.listener_count(DataSpecifier::Request(STRING_SERVICE)),
        1
    );

    assert_eq!(server.start(&noop), Err(StartError::AlreadyStarted));

    // Only one server may occupy a service.
    let mut rival = Server::new(node_a.hub(), STRING_SERVICE);
    assert_eq!(
        rival.start(&noop),
        Err(StartError::Registration(RegistrationError::ServiceOccupied))
    );

    server.stop();
    assert!(!server.is_started());
    assert_eq!(
        node_a.listener_count(DataSpecifier::Request(STRING_SERVICE)),
        0
    );
    // Stopping an already-stopped server is a no-op.
    server.stop();

    server.start(&noop).unwrap();
    {
        let mut scoped = Server::new(node_a.hub(), EMPTY_SERVICE);
        scoped.start(&noop).unwrap();
        assert_eq!(
            node_a.listener_count(DataSpecifier::Request(EMPTY_SERVICE)),
            1
        );
    }
    // Destruction deregisters like an explicit stop.
    assert_eq!(
        node_a.listener_count(DataSpecifier::Request(EMPTY_SERVICE)),
        0
    );

    let mut unregistered = Server::new(node_a.hub(), UNREGISTERED_SERVICE);
    assert_eq!(unregistered.start(&noop), Err(StartError::UnregisteredType));
    assert!(!unregistered.is_started());
}

#[test]
fn test_response_reuses_request_identity() {
    let clock = TestClock::default();
    let a_out = Wire::default();
    let b_out = Wire::default();
    let node_a = test_node(SERVER_NODE, &a_out, &clock);
    let node_b = test_node(CLIENT_NODE, &b_out, &clock);

    let checking = |meta: &RequestMeta,
                    request: &ByteArray,
                    response: &mut ResponseContext<ByteArray>| {
        assert_eq!(meta.source, CLIENT_NODE);
        assert_eq!(meta.priority, Priority::High);
        response.response = request.clone();
    };
    let mut server = Server::new(node_a.hub(), STRING_SERVICE);
    server.start(&checking).unwrap();

    let recorder: Recorder<ByteArray> = Recorder::default();
    let handler = |result| recorder.push(result);
    let mut client = Client::new(node_b.hub(), STRING_SERVICE, &handler).unwrap();
    client.set_priority(Priority::High);

    let request = ByteArray::from_slice(b"ping").unwrap();
    let call = client.call(SERVER_NODE, &request).unwrap();

    // Walk the exchange frame by frame.
    let request_frame = b_out.pop().unwrap();
    assert_eq!(
        request_frame.header.data_spec,
        DataSpecifier::Request(STRING_SERVICE)
    );
    assert_eq!(request_frame.header.source, Some(CLIENT_NODE));
    assert_eq!(request_frame.header.destination, Some(SERVER_NODE));
    assert_eq!(request_frame.header.transfer_id, call.transfer);
    node_a.process(&request_frame);

    let response_frame = a_out.pop().unwrap();
    assert_eq!(
        response_frame.header.data_spec,
        DataSpecifier::Response(STRING_SERVICE)
    );
    assert_eq!(response_frame.header.source, Some(SERVER_NODE));
    assert_eq!(response_frame.header.destination, Some(CLIENT_NODE));
    // The response inherits the request's transfer number and priority.
    assert_eq!(response_frame.header.transfer_id, call.transfer);
    assert_eq!(response_frame.header.priority, Priority::High);
    node_b.process(&response_frame);

    let result = recorder.last().unwrap();
    assert_eq!(result.call_id(), call);
    assert_eq!(result.response(), Some(&request));
}
