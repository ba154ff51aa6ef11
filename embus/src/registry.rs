//! Listener registry
//!
//! Per data-specifier bookkeeping of the node's active listeners, split into
//! three independent classes: message subscribers, service-request listeners
//! (servers) and service-response listeners (clients). Rows live in bounded
//! slot arenas; every add and remove is immediately visible through
//! [`Listeners::count_of`], which external diagnostics rely on being exact.
//!
//! A client row exists for the whole lifetime of its `Client` handle and
//! carries the handle's pending-call count; the client counts as a registered
//! response listener exactly while that count is non-zero. A server row exists
//! only while the `Server` handle is started.

use core::ptr::NonNull;

use crate::core::{ServiceId, SubjectId};
use crate::frame::DataSpecifier;
use crate::link::SendError;
use crate::service::RequestMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationError {
    /// The arena for this listener class is exhausted.
    NoListenerSlotLeft,
    /// Another server is already registered for this service.
    ServiceOccupied,
}

/// Monomorphised request delivery: deserializes the payload, runs the user
/// callback and hands the serialized response (if not suppressed) to `reply`.
///
/// Invoked with the engine lock released; `reply` re-acquires it to transmit.
pub(crate) type RequestThunk =
    unsafe fn(NonNull<()>, &RequestMeta, &[u8], &mut dyn FnMut(&[u8]) -> Result<(), SendError>);

/// Identifies one client row. Valid until passed to [`Listeners::client_remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientToken(u8);

/// Identifies one server row. Valid until passed to [`Listeners::server_remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ServerToken(u8);

/// Identifies one subscriber row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubjectToken(u8);

pub(crate) struct ClientRow {
    pub service: ServiceId,
    pub pending: usize,
}

pub(crate) struct ServerRow {
    service: ServiceId,
    handler: NonNull<()>,
    thunk: RequestThunk,
}

// Safety: the handler pointer is supplied by a started `Server` handle, which
// guarantees the referent outlives the row and removes the row in `stop`/Drop
// before the guarantee ends. The pointer is only dereferenced by the dispatch
// path under the engine's locking discipline.
unsafe impl Send for ServerRow {}

struct SubjectRow {
    subject: SubjectId,
}

pub(crate) struct Listeners<const N: usize> {
    subjects: [Option<SubjectRow>; N],
    servers: [Option<ServerRow>; N],
    clients: [Option<ClientRow>; N],
}

impl<const N: usize> Listeners<N> {
    pub fn new() -> Self {
        Self {
            subjects: core::array::from_fn(|_| None),
            servers: core::array::from_fn(|_| None),
            clients: core::array::from_fn(|_| None),
        }
    }

    /// Exact number of active registrations for a data specifier.
    ///
    /// For the response class this counts client instances with at least one
    /// pending call, not calls.
    pub fn count_of(&self, spec: DataSpecifier) -> usize {
        match spec {
            DataSpecifier::Message(subject) => self
                .subjects
                .iter()
                .flatten()
                .filter(|row| row.subject == subject)
                .count(),
            DataSpecifier::Request(service) => self
                .servers
                .iter()
                .flatten()
                .filter(|row| row.service == service)
                .count(),
            DataSpecifier::Response(service) => self
                .clients
                .iter()
                .flatten()
                .filter(|row| row.service == service && row.pending > 0)
                .count(),
        }
    }

    pub fn subscriber_add(&mut self, subject: SubjectId) -> Result<SubjectToken, RegistrationError> {
        let slot = free_slot(&self.subjects)?;
        self.subjects[usize::from(slot)] = Some(SubjectRow { subject });
        Ok(SubjectToken(slot))
    }

    pub fn subscriber_remove(&mut self, token: SubjectToken) {
        self.subjects[usize::from(token.0)] = None;
    }

    /// Registers the single request listener for a service.
    ///
    /// A service already served by another row is rejected; dispatch therefore
    /// delivers each request to exactly one server.
    pub fn server_add(
        &mut self,
        service: ServiceId,
        handler: NonNull<()>,
        thunk: RequestThunk,
    ) -> Result<ServerToken, RegistrationError> {
        if self
            .servers
            .iter()
            .flatten()
            .any(|row| row.service == service)
        {
            return Err(RegistrationError::ServiceOccupied);
        }

        let slot = free_slot(&self.servers)?;
        self.servers[usize::from(slot)] = Some(ServerRow {
            service,
            handler,
            thunk,
        });
        Ok(ServerToken(slot))
    }

    pub fn server_remove(&mut self, token: ServerToken) {
        self.servers[usize::from(token.0)] = None;
    }

    pub fn server_find(&self, service: ServiceId) -> Option<(NonNull<()>, RequestThunk)> {
        self.servers
            .iter()
            .flatten()
            .find(|row| row.service == service)
            .map(|row| (row.handler, row.thunk))
    }

    /// Allocates the row backing one client instance, initially with no
    /// pending calls (i.e. not yet counted as a response listener).
    pub fn client_add(&mut self, service: ServiceId) -> Result<ClientToken, RegistrationError> {
        let slot = free_slot(&self.clients)?;
        self.clients[usize::from(slot)] = Some(ClientRow {
            service,
            pending: 0,
        });
        Ok(ClientToken(slot))
    }

    pub fn client_remove(&mut self, token: ClientToken) {
        self.clients[usize::from(token.0)] = None;
    }

    pub fn client_row_mut(&mut self, token: ClientToken) -> &mut ClientRow {
        unwrap!(self.clients[usize::from(token.0)].as_mut())
    }

    pub fn client_pending(&self, token: ClientToken) -> usize {
        unwrap!(self.clients[usize::from(token.0)].as_ref()).pending
    }
}

fn free_slot<R, const N: usize>(rows: &[Option<R>; N]) -> Result<u8, RegistrationError> {
    rows.iter()
        .position(Option::is_none)
        .map(|idx| idx as u8)
        .ok_or(RegistrationError::NoListenerSlotLeft)
}
