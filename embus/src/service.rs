//! Service client and server handles
//!
//! A [`Client`] issues typed calls on one service and funnels each call's
//! single result into its bound handler; a [`Server`] answers inbound requests
//! through a user callback. Both follow the same lifecycle discipline: they
//! register themselves with the node while active and deregister synchronously
//! in `stop`/`Drop`, so the engine never touches a dead handle.

use core::marker::PhantomData;
use core::ptr::NonNull;

use canadensis_encoding::{Deserialize, Serialize};

use crate::core::{InvalidValue, NodeId, Priority, ServiceId, TransferId};
use crate::frame::DataLength;
use crate::link::SendError;
use crate::node::{Hub, RawCall};
use crate::pending::RawOutcome;
use crate::time::{Duration, Instant};

pub use crate::registry::RegistrationError;

/// Applied to calls unless overridden with [`Client::set_request_timeout`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Identity of one in-flight call
///
/// Unique among concurrently pending calls; the transfer number may be reused
/// once the call it identified has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CallId {
    /// The node the request was addressed to.
    pub server: NodeId,
    pub service: ServiceId,
    pub transfer: TransferId,
}

/// Terminal outcome of one accepted call
///
/// Exactly one of these reaches the bound handler per accepted call, never
/// zero and never more than one. A timeout is a normal outcome, not an error;
/// transport and configuration failures are synchronous `Err` returns from
/// [`Client::call`] and never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCallResult<R> {
    /// A matching response arrived before the deadline.
    Success { call: CallId, response: R },
    /// The deadline elapsed with no matching response.
    Timeout { call: CallId },
}

impl<R> ServiceCallResult<R> {
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Success { call, .. } | Self::Timeout { call } => *call,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn response(&self) -> Option<&R> {
        match self {
            Self::Success { response, .. } => Some(response),
            Self::Timeout { .. } => None,
        }
    }
}

/// Receives call results on behalf of one or more clients.
///
/// Bound by shared reference, so one handler value may serve several
/// independent clients; handlers keep their own state behind interior
/// mutability. Any `Fn(ServiceCallResult<R>)` closure qualifies.
pub trait CallResultHandler<R> {
    fn on_result(&self, result: ServiceCallResult<R>);
}

impl<R, F: Fn(ServiceCallResult<R>)> CallResultHandler<R> for F {
    fn on_result(&self, result: ServiceCallResult<R>) {
        self(result)
    }
}

/// Metadata of a received request, as presented to a server callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestMeta {
    /// The requesting node, i.e. where the response will go.
    pub source: NodeId,
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// Reception instant assigned by the driver.
    pub timestamp: Instant,
}

/// Mutable response under construction, handed to a server callback.
///
/// Starts out as the default-constructed response with transmission enabled.
/// A callback that calls `set_enabled(false)` suppresses the response
/// entirely; the flag is request-scoped and resets for every request.
pub struct ResponseContext<R> {
    pub response: R,
    enabled: bool,
}

impl<R> ResponseContext<R> {
    pub(crate) fn new(response: R) -> Self {
        Self {
            response,
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Handles inbound requests on behalf of a started server.
///
/// Any `Fn(&RequestMeta, &Req, &mut ResponseContext<Resp>)` closure qualifies.
pub trait RequestHandler<Req, Resp> {
    fn on_request(&self, meta: &RequestMeta, request: &Req, response: &mut ResponseContext<Resp>);
}

impl<Req, Resp, F> RequestHandler<Req, Resp> for F
where
    F: Fn(&RequestMeta, &Req, &mut ResponseContext<Resp>),
{
    fn on_request(&self, meta: &RequestMeta, request: &Req, response: &mut ResponseContext<Resp>) {
        self(meta, request, response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceCallError {
    /// The service is not present in the node's data-type registry.
    UnregisteredType,
    /// The pending-call table is full. Nothing was sent.
    NoCallSlotLeft,
    /// All transfer numbers towards this server are occupied by pending calls.
    NoFreeTransferId,
    /// The serialized request does not fit a single transport frame.
    PayloadTooLong,
    /// The transport rejected the frame. Nothing is pending.
    Transport(SendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartError {
    /// `start` was called twice without an intervening `stop`.
    AlreadyStarted,
    /// The service is not present in the node's data-type registry.
    UnregisteredType,
    Registration(RegistrationError),
}

impl From<RegistrationError> for StartError {
    fn from(value: RegistrationError) -> Self {
        Self::Registration(value)
    }
}

/// Issues service calls on one service
///
/// A client may have any number of calls in flight at once, to the same or
/// different server nodes; each produces its own independent result. The
/// client occupies a response-listener slot from the moment its first call is
/// placed until its last pending call resolves, and frees everything it owns
/// synchronously when dropped; calls still in flight at that point are
/// silently discarded.
///
/// # Examples
///
/// ```
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
/// use embus::core::{NodeId, ServiceId};
/// use embus::data_types::{ByteArray, StaticRegistry};
/// use embus::frame::Frame;
/// use embus::link::{FrameSink, SendError};
/// use embus::node::Node;
/// use embus::service::{Client, ServiceCallResult};
/// use embus::time::{Clock, Instant};
///
/// struct DiscardSink;
/// impl FrameSink for DiscardSink {
///     fn try_send(&mut self, _frame: &Frame) -> Result<(), SendError> {
///         Ok(())
///     }
/// }
///
/// struct FixedClock;
/// impl Clock for FixedClock {
///     fn now(&self) -> Instant {
///         Instant::MIN
///     }
/// }
///
/// static SERVICES: [ServiceId; 1] = [ServiceId::from_u16_truncating(100)];
///
/// let node: Node<CriticalSectionRawMutex, _, _, _, 4, 4> = Node::new(
///     NodeId::from_u8_truncating(10),
///     DiscardSink,
///     FixedClock,
///     StaticRegistry::new(&SERVICES),
/// );
///
/// let handler = |_result: ServiceCallResult<ByteArray>| {
///     // Runs from `Node::process` or `Node::sweep` on a later tick.
/// };
/// let mut client = Client::new(node.hub(), SERVICES[0], &handler).unwrap();
///
/// let call = client
///     .call(NodeId::from_u8_truncating(42), &ByteArray::default())
///     .unwrap();
/// assert!(client.has_pending_calls());
///
/// // Cancellation discards the call without delivering a result.
/// client.cancel(call);
/// assert!(!client.has_pending_calls());
/// ```
pub struct Client<'a, Req, Resp, H> {
    hub: Hub<'a>,
    token: crate::registry::ClientToken,
    service: ServiceId,
    priority: Priority,
    timeout: Duration,
    handler: &'a H,
    _request: PhantomData<fn(Req)>,
    _response: PhantomData<fn() -> Resp>,
}

impl<'a, Req, Resp, H> Client<'a, Req, Resp, H>
where
    Req: Serialize,
    Resp: Deserialize,
    H: CallResultHandler<Resp> + Sync,
{
    /// Creates a client for `service`, bound to `handler`.
    ///
    /// The client is not a response listener yet; it becomes one when its
    /// first call is placed. Fails when the client arena is exhausted.
    pub fn new(hub: Hub<'a>, service: ServiceId, handler: &'a H) -> Result<Self, RegistrationError> {
        let token = hub.node().client_register(service)?;

        Ok(Self {
            hub,
            token,
            service,
            priority: Priority::Nominal,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            handler,
            _request: PhantomData,
            _response: PhantomData,
        })
    }

    /// The bound result handler. Binding it to another client of the same
    /// type fans both clients' results into one handler value.
    pub fn callback(&self) -> &'a H {
        self.handler
    }

    /// Rebinds the result handler. Applies to subsequent calls only; calls in
    /// flight deliver to the handler they were placed with.
    pub fn set_callback(&mut self, handler: &'a H) {
        self.handler = handler;
    }

    /// Sets the timeout applied to subsequent calls. Calls in flight keep
    /// their original deadline. A zero duration is rejected.
    pub fn set_request_timeout(&mut self, timeout: Duration) -> Result<(), InvalidValue> {
        if timeout.as_ticks() == 0 {
            return Err(InvalidValue);
        }
        self.timeout = timeout;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the transfer priority of subsequent calls.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Issues a call to `server`.
    ///
    /// On success the request is on its way, the call is pending with
    /// deadline `now + request_timeout`, and the returned [`CallId`] carries
    /// the allocated transfer number. On error nothing is pending and nothing
    /// was sent (except for a transport rejection, where the send itself
    /// failed).
    pub fn call(&mut self, server: NodeId, request: &Req) -> Result<CallId, ServiceCallError> {
        let length = request.size_bits().div_ceil(8);
        if length > DataLength::MAX {
            return Err(ServiceCallError::PayloadTooLong);
        }
        let mut buffer = [0u8; DataLength::MAX];
        request.serialize_to_bytes(&mut buffer[..length]);

        self.hub.node().client_call(
            self.token,
            RawCall {
                service: self.service,
                server,
                priority: self.priority,
                timeout: self.timeout,
                handler: NonNull::from(self.handler).cast(),
                thunk: response_thunk::<Resp, H>,
                payload: &buffer[..length],
            },
        )
    }

    /// Discards one pending call without delivering a result.
    ///
    /// A call that already completed (or never belonged to this client) is
    /// left alone; cancellation is always a no-op in that case.
    pub fn cancel(&mut self, call: CallId) {
        self.hub.node().client_cancel(self.token, call);
    }

    /// True while at least one call of this client awaits its result.
    pub fn has_pending_calls(&self) -> bool {
        self.pending_calls() > 0
    }

    pub fn pending_calls(&self) -> usize {
        self.hub.node().client_pending(self.token)
    }
}

impl<'a, Req, Resp, H> Drop for Client<'a, Req, Resp, H> {
    fn drop(&mut self) {
        self.hub.node().client_release(self.token);
    }
}

/// Answers requests on one service
///
/// Stateless per request: each inbound request is dispatched to the callback
/// as it arrives, with a default-constructed response to fill in or suppress.
/// Only one server may be started per service on a node.
pub struct Server<'a, Req, Resp, H> {
    hub: Hub<'a>,
    service: ServiceId,
    token: Option<crate::registry::ServerToken>,
    _handler: PhantomData<&'a H>,
    _request: PhantomData<fn() -> Req>,
    _response: PhantomData<fn(Resp)>,
}

impl<'a, Req, Resp, H> Server<'a, Req, Resp, H>
where
    Req: Deserialize,
    Resp: Serialize + Default,
    H: RequestHandler<Req, Resp> + Sync,
{
    /// Creates a server for `service`. It listens for nothing until started.
    pub fn new(hub: Hub<'a>, service: ServiceId) -> Self {
        Self {
            hub,
            service,
            token: None,
            _handler: PhantomData,
            _request: PhantomData,
            _response: PhantomData,
        }
    }

    /// Binds `handler` and registers as the request listener for the service.
    ///
    /// Fails if already started, if the service is absent from the data-type
    /// registry, or if another server occupies the service.
    pub fn start(&mut self, handler: &'a H) -> Result<(), StartError> {
        if self.token.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        let token = self.hub.node().server_register(
            self.service,
            NonNull::from(handler).cast(),
            request_thunk::<Req, Resp, H>,
        )?;
        self.token = Some(token);
        Ok(())
    }

    /// Deregisters the request listener. Idempotent.
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            self.hub.node().server_unregister(token);
        }
    }

    pub fn is_started(&self) -> bool {
        self.token.is_some()
    }
}

impl<'a, Req, Resp, H> Drop for Server<'a, Req, Resp, H> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.hub.node().server_unregister(token);
        }
    }
}

/// See [`crate::pending::ResponseThunk`] for the contract.
unsafe fn response_thunk<Resp, H>(
    handler: NonNull<()>,
    call: CallId,
    outcome: RawOutcome<'_>,
    commit: &mut dyn FnMut(CallId) -> bool,
) where
    Resp: Deserialize,
    H: CallResultHandler<Resp>,
{
    // Safety: the pointer was created from a `&H` outliving the client that
    // placed the call, and the entry it came from was alive moments ago with
    // no user code having run since.
    let handler = unsafe { handler.cast::<H>().as_ref() };

    match outcome {
        RawOutcome::Response(payload) => match Resp::deserialize_from_bytes(payload) {
            Ok(response) => {
                if commit(call) {
                    handler.on_result(ServiceCallResult::Success { call, response });
                }
            }
            Err(_) => {
                // The call stays pending, as if the frame never arrived.
                warn!("dropping undeserializable service response {:?}", call);
            }
        },
        RawOutcome::Timeout => handler.on_result(ServiceCallResult::Timeout { call }),
    }
}

/// See [`crate::registry::RequestThunk`] for the contract.
unsafe fn request_thunk<Req, Resp, H>(
    handler: NonNull<()>,
    meta: &RequestMeta,
    payload: &[u8],
    reply: &mut dyn FnMut(&[u8]) -> Result<(), SendError>,
) where
    Req: Deserialize,
    Resp: Serialize + Default,
    H: RequestHandler<Req, Resp>,
{
    // Safety: the pointer was created from a `&H` outliving the started
    // server, whose registry row was alive moments ago with no user code
    // having run since.
    let handler = unsafe { handler.cast::<H>().as_ref() };

    let request = match Req::deserialize_from_bytes(payload) {
        Ok(request) => request,
        Err(_) => {
            warn!("dropping undeserializable service request from {:?}", meta.source);
            return;
        }
    };

    let mut context = ResponseContext::new(Resp::default());
    handler.on_request(meta, &request, &mut context);
    if !context.is_enabled() {
        trace!("service response suppressed for {:?}", meta.source);
        return;
    }

    let length = context.response.size_bits().div_ceil(8);
    if length > DataLength::MAX {
        warn!("service response does not fit a frame, dropping");
        return;
    }
    let mut buffer = [0u8; DataLength::MAX];
    context.response.serialize_to_bytes(&mut buffer[..length]);

    if let Err(error) = reply(&buffer[..length]) {
        warn!("failed to transmit service response: {:?}", error);
    }
}
