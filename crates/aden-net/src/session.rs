//! Session identity and the factories the listener consumes.
//!
//! A session is the application state correlated 1:1 with a connection. The
//! dispatch core never looks inside it beyond its id and its current state.

use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::PacketCodec;

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`SessionId`]s.
///
/// Ids are never handed out twice for the lifetime of the generator.
pub struct SessionIdGenerator {
    next: AtomicU32,
}

impl SessionIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection application state.
///
/// Implementations keep their own interior mutability: the session is shared
/// between the receive loop, the registry hooks and whatever application code
/// holds on to it.
pub trait Session: Send + Sync + 'static {
    /// Protocol state used to gate which packets are accepted.
    type State: Copy + Eq + Debug + Send + Sync + 'static;

    /// The session's unique id.
    fn id(&self) -> SessionId;

    /// The session's current protocol state.
    fn state(&self) -> Self::State;
}

/// Creates a fresh session for every accepted socket.
pub trait SessionFactory<S: Session>: Send + Sync + 'static {
    /// Produce a new session with a unique id.
    fn create(&self) -> S;
}

impl<S, F> SessionFactory<S> for F
where
    S: Session,
    F: Fn() -> S + Send + Sync + 'static,
{
    fn create(&self) -> S {
        self()
    }
}

/// Creates the codec bound to a session's negotiated state.
pub trait PacketCodecFactory<S: Session>: Send + Sync + 'static {
    /// Build the codec for `session`.
    fn create(&self, session: &S) -> PacketCodec;
}

impl<S, F> PacketCodecFactory<S> for F
where
    S: Session,
    F: Fn(&S) -> PacketCodec + Send + Sync + 'static,
{
    fn create(&self, session: &S) -> PacketCodec {
        self(session)
    }
}
