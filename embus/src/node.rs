//! Bus node: the service dispatch and sweep engine
//!
//! [`Node`] owns the listener registry, the pending-call table, the transport
//! sink, the clock and the data-type registry. The host event loop feeds it
//! decoded inbound frames through [`Node::process`] and drives deadline
//! eviction through [`Node::sweep`], typically once per tick. Clients and
//! servers are created from the [`Hub`] handle and talk to the engine through
//! a type-erased interface; payloads cross that boundary as bytes.
//!
//! All shared state sits in one blocking mutex. The engine acquires it for
//! bookkeeping only and always releases it before running a user callback, so
//! callbacks are free to call back into the engine; every delivery loop
//! re-searches the shared state afterwards instead of holding iteration state
//! across the callback.

use core::cell::RefCell;
use core::ptr::NonNull;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::core::{NodeId, Priority, ServiceId, TransferId};
use crate::data_types::DataTypeRegistry;
use crate::frame::{Data, DataSpecifier, Frame, Header};
use crate::link::FrameSink;
use crate::pending::{CallTable, PendingCall, RawOutcome, ResponseThunk};
use crate::registry::{ClientToken, Listeners, RegistrationError, RequestThunk, ServerToken};
use crate::service::{CallId, RequestMeta, ServiceCallError, StartError};
use crate::time::{Clock, Duration};

/// Parameters of one call, as they cross the typed/erased boundary.
pub(crate) struct RawCall<'p> {
    pub service: ServiceId,
    pub server: NodeId,
    pub priority: Priority,
    pub timeout: Duration,
    pub handler: NonNull<()>,
    pub thunk: ResponseThunk,
    pub payload: &'p [u8],
}

/// The engine interface used by `Client` and `Server` handles.
pub(crate) trait DynamicNode {
    fn client_register(&self, service: ServiceId) -> Result<ClientToken, RegistrationError>;
    fn client_release(&self, token: ClientToken);
    fn client_pending(&self, token: ClientToken) -> usize;
    fn client_call(&self, token: ClientToken, call: RawCall<'_>)
    -> Result<CallId, ServiceCallError>;
    fn client_cancel(&self, token: ClientToken, call: CallId);
    fn server_register(
        &self,
        service: ServiceId,
        handler: NonNull<()>,
        thunk: RequestThunk,
    ) -> Result<ServerToken, StartError>;
    fn server_unregister(&self, token: ServerToken);
}

/// Shared handle for creating new clients and servers.
#[derive(Clone, Copy)]
pub struct Hub<'a>(&'a (dyn DynamicNode + Sync));

impl<'a> Hub<'a> {
    pub(crate) fn new(node: &'a (dyn DynamicNode + Sync)) -> Self {
        Self(node)
    }

    pub(crate) fn node(self) -> &'a (dyn DynamicNode + Sync) {
        self.0
    }
}

struct Shared<T, C, R, const CALLS: usize, const LISTENERS: usize> {
    sink: T,
    clock: C,
    types: R,
    listeners: Listeners<LISTENERS>,
    calls: CallTable<CALLS>,
    next_transfer: TransferId,
}

impl<T, C, R, const CALLS: usize, const LISTENERS: usize> Shared<T, C, R, CALLS, LISTENERS> {
    /// Picks a transfer number not used by any call pending towards the same
    /// (server, service) session.
    fn allocate_transfer(
        &mut self,
        server: NodeId,
        service: ServiceId,
    ) -> Result<TransferId, ServiceCallError> {
        let mut candidate = self.next_transfer;
        for _ in 0..=u8::from(TransferId::MAX) {
            let key = CallId {
                server,
                service,
                transfer: candidate,
            };
            if !self.calls.contains(key) {
                self.next_transfer = candidate.next();
                return Ok(candidate);
            }
            candidate = candidate.next();
        }
        Err(ServiceCallError::NoFreeTransferId)
    }
}

/// One bus node's service-call engine
///
/// `CALLS` bounds the number of concurrently pending calls across all clients;
/// `LISTENERS` bounds each listener class (client instances, started servers).
pub struct Node<M: RawMutex, T, C, R, const CALLS: usize, const LISTENERS: usize> {
    address: NodeId,
    shared: Mutex<M, RefCell<Shared<T, C, R, CALLS, LISTENERS>>>,
}

impl<M, T, C, R, const CALLS: usize, const LISTENERS: usize> Node<M, T, C, R, CALLS, LISTENERS>
where
    M: RawMutex + Sync,
    T: FrameSink + Send,
    C: Clock + Send,
    R: DataTypeRegistry + Send,
{
    pub fn new(address: NodeId, sink: T, clock: C, types: R) -> Self {
        const {
            assert!(LISTENERS <= 256, "listener tokens are 8-bit slot indices");
        }

        Self {
            address,
            shared: Mutex::new(RefCell::new(Shared {
                sink,
                clock,
                types,
                listeners: Listeners::new(),
                calls: CallTable::new(),
                next_transfer: TransferId::default(),
            })),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.address
    }

    pub fn hub(&self) -> Hub<'_> {
        Hub::new(self)
    }

    /// Exact number of active listeners for a data specifier.
    ///
    /// For the response class this is the number of client instances with at
    /// least one pending call, consistent with the latest completed
    /// `process`/`sweep`/`call` at every observable point.
    pub fn listener_count(&self, spec: DataSpecifier) -> usize {
        self.with(|shared| shared.listeners.count_of(spec))
    }

    /// Delivers one decoded inbound frame to the matching listener.
    ///
    /// Frames that match nothing (responses to calls no longer pending,
    /// requests for services without a server, service frames addressed to
    /// other nodes, message traffic) are dropped silently; all of these are
    /// expected on a shared bus.
    pub fn process(&self, frame: &Frame) {
        match frame.header.data_spec {
            DataSpecifier::Response(service) => self.process_response(service, frame),
            DataSpecifier::Request(service) => self.process_request(service, frame),
            DataSpecifier::Message(_) => {
                trace!("message traffic is not handled by this node");
            }
        }
    }

    /// Evicts every call whose deadline has passed, delivering one `Timeout`
    /// result each, earliest deadline first.
    ///
    /// A timeout handler may place new calls, cancel others, or re-enter
    /// `sweep`; the loop re-searches the table after every delivery.
    pub fn sweep(&self) {
        loop {
            let expired = self.with(|shared| {
                let now = shared.clock.now();
                let entry = shared.calls.take_expired(now)?;
                shared.listeners.client_row_mut(entry.owner).pending -= 1;
                Some(entry)
            });
            let Some(entry) = expired else { break };

            debug!("service call timed out: {:?}", entry.key);
            let mut no_commit = |_: CallId| false;
            // The entry is already evicted; the thunk only delivers.
            unsafe { (entry.thunk)(entry.handler, entry.key, RawOutcome::Timeout, &mut no_commit) };
        }
    }

    fn with<U>(&self, f: impl FnOnce(&mut Shared<T, C, R, CALLS, LISTENERS>) -> U) -> U {
        self.shared.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn process_response(&self, service: ServiceId, frame: &Frame) {
        if frame.header.destination != Some(self.address) {
            return;
        }
        let Some(source) = frame.header.source else {
            return;
        };
        let call = CallId {
            server: source,
            service,
            transfer: frame.header.transfer_id,
        };

        let matched = self.with(|shared| {
            shared
                .calls
                .get(call)
                .map(|entry| (entry.handler, entry.thunk))
        });
        let Some((handler, thunk)) = matched else {
            // Expected race: the call may have timed out or been cancelled
            // while this response was on the bus.
            trace!("unmatched service response: {:?}", call);
            return;
        };

        let mut commit = |call: CallId| {
            self.with(|shared| match shared.calls.remove(call) {
                Some(entry) => {
                    shared.listeners.client_row_mut(entry.owner).pending -= 1;
                    true
                }
                None => false,
            })
        };
        unsafe { thunk(handler, call, RawOutcome::Response(&frame.data), &mut commit) };
    }

    fn process_request(&self, service: ServiceId, frame: &Frame) {
        if frame.header.destination != Some(self.address) {
            return;
        }
        let Some(source) = frame.header.source else {
            return;
        };

        let Some((handler, thunk)) = self.with(|shared| shared.listeners.server_find(service))
        else {
            trace!("no server for service request: {:?}", service);
            return;
        };

        let meta = RequestMeta {
            source,
            transfer_id: frame.header.transfer_id,
            priority: frame.header.priority,
            timestamp: frame.timestamp,
        };
        let mut reply = |payload: &[u8]| {
            self.with(|shared| {
                // The thunk never passes more than a frame's worth of bytes.
                let data = unwrap!(Data::new_padded(payload));
                let now = shared.clock.now();
                let response = Frame {
                    header: Header {
                        priority: meta.priority,
                        data_spec: DataSpecifier::Response(service),
                        source: Some(self.address),
                        destination: Some(meta.source),
                        transfer_id: meta.transfer_id,
                    },
                    data,
                    timestamp: now,
                };
                shared.sink.try_send(&response)
            })
        };
        unsafe { thunk(handler, &meta, &frame.data, &mut reply) };
    }
}

impl<M, T, C, R, const CALLS: usize, const LISTENERS: usize> DynamicNode
    for Node<M, T, C, R, CALLS, LISTENERS>
where
    M: RawMutex + Sync,
    T: FrameSink + Send,
    C: Clock + Send,
    R: DataTypeRegistry + Send,
{
    fn client_register(&self, service: ServiceId) -> Result<ClientToken, RegistrationError> {
        self.with(|shared| shared.listeners.client_add(service))
    }

    fn client_release(&self, token: ClientToken) {
        self.with(|shared| {
            let dropped = shared.calls.purge_owner(token);
            if dropped > 0 {
                trace!("discarded {} in-flight calls of a destroyed client", dropped);
            }
            shared.listeners.client_remove(token);
        })
    }

    fn client_pending(&self, token: ClientToken) -> usize {
        self.with(|shared| shared.listeners.client_pending(token))
    }

    fn client_call(
        &self,
        token: ClientToken,
        call: RawCall<'_>,
    ) -> Result<CallId, ServiceCallError> {
        self.with(|shared| {
            if !shared.types.contains_service(call.service) {
                return Err(ServiceCallError::UnregisteredType);
            }
            let slot = shared
                .calls
                .reserve()
                .ok_or(ServiceCallError::NoCallSlotLeft)?;
            let data =
                Data::new_padded(call.payload).map_err(|_| ServiceCallError::PayloadTooLong)?;
            let transfer = shared.allocate_transfer(call.server, call.service)?;
            let key = CallId {
                server: call.server,
                service: call.service,
                transfer,
            };

            let now = shared.clock.now();
            let frame = Frame {
                header: Header {
                    priority: call.priority,
                    data_spec: DataSpecifier::Request(call.service),
                    source: Some(self.address),
                    destination: Some(call.server),
                    transfer_id: transfer,
                },
                data,
                timestamp: now,
            };
            // A rejected send leaves no trace: the slot was only reserved.
            shared
                .sink
                .try_send(&frame)
                .map_err(ServiceCallError::Transport)?;

            shared.calls.occupy(
                slot,
                PendingCall {
                    key,
                    deadline: now + call.timeout,
                    owner: token,
                    handler: call.handler,
                    thunk: call.thunk,
                },
            );
            shared.listeners.client_row_mut(token).pending += 1;
            trace!("service call placed: {:?}", key);
            Ok(key)
        })
    }

    fn client_cancel(&self, token: ClientToken, call: CallId) {
        self.with(|shared| {
            if shared.calls.remove_owned(call, token).is_some() {
                shared.listeners.client_row_mut(token).pending -= 1;
                trace!("service call cancelled: {:?}", call);
            }
        })
    }

    fn server_register(
        &self,
        service: ServiceId,
        handler: NonNull<()>,
        thunk: RequestThunk,
    ) -> Result<ServerToken, StartError> {
        self.with(|shared| {
            if !shared.types.contains_service(service) {
                return Err(StartError::UnregisteredType);
            }
            let token = shared.listeners.server_add(service, handler, thunk)?;
            trace!("service server started: {:?}", service);
            Ok(token)
        })
    }

    fn server_unregister(&self, token: ServerToken) {
        self.with(|shared| shared.listeners.server_remove(token))
    }
}
