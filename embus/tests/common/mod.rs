#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embus::core::{NodeId, ServiceId};
use embus::data_types::StaticRegistry;
use embus::frame::Frame;
use embus::link::{FrameSink, SendError};
use embus::node::Node;
use embus::service::ServiceCallResult;
use embus::time::{Clock, Duration, Instant};

pub const SERVER_NODE: NodeId = NodeId::from_u8_truncating(1);
pub const CLIENT_NODE: NodeId = NodeId::from_u8_truncating(2);
pub const ABSENT_NODE: NodeId = NodeId::from_u8_truncating(99);

pub const STRING_SERVICE: ServiceId = ServiceId::from_u16_truncating(100);
pub const EMPTY_SERVICE: ServiceId = ServiceId::from_u16_truncating(101);
pub const UNREGISTERED_SERVICE: ServiceId = ServiceId::from_u16_truncating(300);

pub static SERVICES: [ServiceId; 2] = [STRING_SERVICE, EMPTY_SERVICE];

pub type TestNode = Node<CriticalSectionRawMutex, QueueSink, TestClock, StaticRegistry, 8, 8>;

pub fn test_node(address: NodeId, out: &Wire, clock: &TestClock) -> TestNode {
    Node::new(
        address,
        QueueSink(out.clone()),
        clock.clone(),
        StaticRegistry::new(&SERVICES),
    )
}

/// Settable monotonic clock shared between nodes and the test body.
#[derive(Clone, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn advance(&self, duration: Duration) {
        self.0.fetch_add(duration.as_micros(), Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        Instant::MIN + Duration::from_micros(self.0.load(Ordering::Relaxed))
    }
}

pub fn ts(us: u64) -> Instant {
    Instant::MIN + Duration::from_micros(us)
}

/// One direction of the bus: every frame a node emits, in emission order.
#[derive(Clone, Default)]
pub struct Wire(Arc<Mutex<VecDeque<Frame>>>);

impl Wire {
    pub fn pop(&self) -> Option<Frame> {
        self.0.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub struct QueueSink(pub Wire);

impl FrameSink for QueueSink {
    fn try_send(&mut self, frame: &Frame) -> Result<(), SendError> {
        self.0.0.lock().unwrap().push_back(*frame);
        Ok(())
    }
}

/// Transport that accepts nothing.
pub struct DownSink;

impl FrameSink for DownSink {
    fn try_send(&mut self, _frame: &Frame) -> Result<(), SendError> {
        Err(SendError::Down)
    }
}

/// Delivers queued frames in both directions until the bus is quiet, then
/// runs one sweep tick on each node.
pub fn spin(node_a: &TestNode, a_out: &Wire, node_b: &TestNode, b_out: &Wire) {
    loop {
        let mut idle = true;
        while let Some(frame) = a_out.pop() {
            idle = false;
            node_b.process(&frame);
        }
        while let Some(frame) = b_out.pop() {
            idle = false;
            node_a.process(&frame);
        }
        if idle {
            break;
        }
    }
    node_a.sweep();
    node_b.sweep();
}

/// Accumulates delivered call results; bind it through a closure:
/// `|result| recorder.push(result)`.
pub struct Recorder<R> {
    results: Mutex<Vec<ServiceCallResult<R>>>,
}

impl<R> Default for Recorder<R> {
    fn default() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
        }
    }
}

impl<R: Clone> Recorder<R> {
    pub fn push(&self, result: ServiceCallResult<R>) {
        self.results.lock().unwrap().push(result);
    }

    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<ServiceCallResult<R>> {
        self.results.lock().unwrap().last().cloned()
    }

    pub fn all(&self) -> Vec<ServiceCallResult<R>> {
        self.results.lock().unwrap().clone()
    }
}
