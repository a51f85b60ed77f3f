//! Opcode table and connection lifecycle hooks for one server role.
//!
//! A [`RegistryBuilder`] collects packet registrations during startup and is
//! consumed by [`RegistryBuilder::build`]. The resulting [`PacketRegistry`] has
//! no mutating methods, so the receive loops of every connection share it
//! through an `Arc` without locking.
//!
//! Each registration stores a function pointer monomorphised for its packet
//! type. Dispatch is a map lookup followed by a direct call.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use futures::future::BoxFuture;

use crate::connection::Connection;
use crate::packet::{IncomingPacket, PacketCode, PacketError, PacketOutcome, PacketReader, ReadError};
use crate::session::Session;

/// Boxed future produced by dispatching one frame.
pub type DispatchFuture<'c> = BoxFuture<'c, Result<PacketOutcome, PacketError>>;

type DispatchFn<S> = for<'c> fn(
    &mut PacketReader<'_>,
    bool,
    &'c Connection<S>,
    &'c S,
) -> Result<DispatchFuture<'c>, PacketError>;

fn dispatch_packet<'c, S, P>(
    reader: &mut PacketReader<'_>,
    allow_trailing_bytes: bool,
    connection: &'c Connection<S>,
    session: &'c S,
) -> Result<DispatchFuture<'c>, PacketError>
where
    S: Session,
    P: IncomingPacket<S>,
{
    let mut packet = P::default();
    packet.read_body(reader)?;
    if !allow_trailing_bytes {
        reader.finish()?;
    }
    Ok(Box::pin(packet.process(connection, session)))
}

/// Width of the opcode field at the start of every body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpcodeWidth {
    /// One byte.
    #[default]
    U8,
    /// Two bytes, little-endian.
    U16,
}

impl OpcodeWidth {
    fn max_opcode(self) -> u16 {
        match self {
            OpcodeWidth::U8 => u8::MAX as u16,
            OpcodeWidth::U16 => u16::MAX,
        }
    }
}

/// Errors detected while building a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("packet code {0} registered twice")]
    DuplicateCode(PacketCode),

    #[error("opcode 0x{opcode:02X} registered both with and without sub-opcodes")]
    ExtendedConflict { opcode: u16 },

    #[error("opcode 0x{opcode:02X} does not fit a {width:?} opcode field")]
    OpcodeOutOfRange { opcode: u16, width: OpcodeWidth },
}

/// A callback run when a connection starts or finishes.
pub trait ConnectionHook<S: Session>: Send + Sync + 'static {
    fn call(&self, connection: &Connection<S>);
}

impl<S, F> ConnectionHook<S> for F
where
    S: Session,
    F: Fn(&Connection<S>) + Send + Sync + 'static,
{
    fn call(&self, connection: &Connection<S>) {
        self(connection);
    }
}

/// Everything the receive loop needs to dispatch one packet type.
pub struct PacketDescriptor<S: Session> {
    code: PacketCode,
    name: &'static str,
    allowed_states: Option<Vec<S::State>>,
    dispatch: DispatchFn<S>,
}

impl<S: Session> PacketDescriptor<S> {
    pub fn code(&self) -> PacketCode {
        self.code
    }

    /// Type name of the registered packet, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the packet is accepted while the session is in `state`.
    /// Packets registered without a state list are accepted in every state.
    pub fn is_allowed_in(&self, state: S::State) -> bool {
        self.allowed_states
            .as_ref()
            .is_none_or(|states| states.contains(&state))
    }
}

/// Handle returned by [`RegistryBuilder::register`] to refine a registration.
pub struct PacketRegistration<'a, S: Session> {
    descriptor: &'a mut PacketDescriptor<S>,
}

impl<S: Session> PacketRegistration<'_, S> {
    /// Restrict the packet to the given session states.
    pub fn allowed_states(self, states: impl IntoIterator<Item = S::State>) -> Self {
        self.descriptor.allowed_states = Some(states.into_iter().collect());
        self
    }
}

/// Mutable startup-time view of a registry.
pub struct RegistryBuilder<S: Session> {
    opcode_width: OpcodeWidth,
    allow_trailing_bytes: bool,
    descriptors: Vec<PacketDescriptor<S>>,
    on_connected: Option<Box<dyn ConnectionHook<S>>>,
    on_disconnected: Option<Box<dyn ConnectionHook<S>>>,
}

impl<S: Session> RegistryBuilder<S> {
    pub fn new() -> Self {
        Self {
            opcode_width: OpcodeWidth::default(),
            allow_trailing_bytes: false,
            descriptors: Vec::new(),
            on_connected: None,
            on_disconnected: None,
        }
    }

    /// Set the width of the opcode field. Sub-opcodes are always two bytes.
    pub fn opcode_width(&mut self, width: OpcodeWidth) -> &mut Self {
        self.opcode_width = width;
        self
    }

    /// Accept bodies with unread bytes after the packet's fields. Off by
    /// default: leftover bytes fail the frame.
    pub fn allow_trailing_bytes(&mut self, allow: bool) -> &mut Self {
        self.allow_trailing_bytes = allow;
        self
    }

    /// Register packet type `P` for `opcode`.
    pub fn register<P: IncomingPacket<S>>(&mut self, opcode: u16) -> PacketRegistration<'_, S> {
        self.push::<P>(PacketCode::new(opcode))
    }

    /// Register packet type `P` for `opcode` followed by a two-byte `sub_opcode`.
    pub fn register_extended<P: IncomingPacket<S>>(
        &mut self,
        opcode: u16,
        sub_opcode: u16,
    ) -> PacketRegistration<'_, S> {
        self.push::<P>(PacketCode::extended(opcode, sub_opcode))
    }

    fn push<P: IncomingPacket<S>>(&mut self, code: PacketCode) -> PacketRegistration<'_, S> {
        let index = self.descriptors.len();
        self.descriptors.push(PacketDescriptor {
            code,
            name: std::any::type_name::<P>(),
            allowed_states: None,
            dispatch: dispatch_packet::<S, P>,
        });
        PacketRegistration {
            descriptor: &mut self.descriptors[index],
        }
    }

    /// Hook run once when a connection starts receiving.
    pub fn on_connected(&mut self, hook: impl ConnectionHook<S>) -> &mut Self {
        self.on_connected = Some(Box::new(hook));
        self
    }

    /// Hook run once after a started connection has shut its socket down.
    pub fn on_disconnected(&mut self, hook: impl ConnectionHook<S>) -> &mut Self {
        self.on_disconnected = Some(Box::new(hook));
        self
    }

    /// Freeze the table.
    pub fn build(self) -> Result<PacketRegistry<S>, RegistryError> {
        let mut plain = HashMap::new();
        let mut extended: HashMap<u16, HashMap<u16, PacketDescriptor<S>>> = HashMap::new();

        for descriptor in self.descriptors {
            let code = descriptor.code;
            if code.opcode > self.opcode_width.max_opcode() {
                return Err(RegistryError::OpcodeOutOfRange {
                    opcode: code.opcode,
                    width: self.opcode_width,
                });
            }

            match code.sub_opcode {
                None => {
                    if extended.contains_key(&code.opcode) {
                        return Err(RegistryError::ExtendedConflict {
                            opcode: code.opcode,
                        });
                    }
                    if plain.insert(code.opcode, descriptor).is_some() {
                        return Err(RegistryError::DuplicateCode(code));
                    }
                }
                Some(sub_opcode) => {
                    if plain.contains_key(&code.opcode) {
                        return Err(RegistryError::ExtendedConflict {
                            opcode: code.opcode,
                        });
                    }
                    match extended.entry(code.opcode).or_default().entry(sub_opcode) {
                        Entry::Occupied(_) => return Err(RegistryError::DuplicateCode(code)),
                        Entry::Vacant(slot) => {
                            slot.insert(descriptor);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            packets = plain.len() + extended.values().map(HashMap::len).sum::<usize>(),
            "packet registry built"
        );

        Ok(PacketRegistry {
            opcode_width: self.opcode_width,
            allow_trailing_bytes: self.allow_trailing_bytes,
            plain,
            extended,
            on_connected: self.on_connected,
            on_disconnected: self.on_disconnected,
        })
    }
}

impl<S: Session> Default for RegistryBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable opcode table plus lifecycle hooks.
pub struct PacketRegistry<S: Session> {
    opcode_width: OpcodeWidth,
    allow_trailing_bytes: bool,
    plain: HashMap<u16, PacketDescriptor<S>>,
    extended: HashMap<u16, HashMap<u16, PacketDescriptor<S>>>,
    on_connected: Option<Box<dyn ConnectionHook<S>>>,
    on_disconnected: Option<Box<dyn ConnectionHook<S>>>,
}

impl<S: Session> PacketRegistry<S> {
    pub fn builder() -> RegistryBuilder<S> {
        RegistryBuilder::new()
    }

    /// Read the packet code at the start of a body. The sub-opcode is read
    /// only when the opcode was registered as extended.
    pub fn read_code(&self, reader: &mut PacketReader<'_>) -> Result<PacketCode, ReadError> {
        let opcode = match self.opcode_width {
            OpcodeWidth::U8 => reader.read_u8()? as u16,
            OpcodeWidth::U16 => reader.read_u16()?,
        };
        if self.extended.contains_key(&opcode) {
            Ok(PacketCode::extended(opcode, reader.read_u16()?))
        } else {
            Ok(PacketCode::new(opcode))
        }
    }

    pub fn resolve(&self, code: PacketCode) -> Option<&PacketDescriptor<S>> {
        match code.sub_opcode {
            None => self.plain.get(&code.opcode),
            Some(sub_opcode) => self.extended.get(&code.opcode)?.get(&sub_opcode),
        }
    }

    /// Parse the rest of the body as `descriptor`'s packet type and return
    /// the future that processes it.
    pub fn dispatch<'c>(
        &self,
        descriptor: &PacketDescriptor<S>,
        reader: &mut PacketReader<'_>,
        connection: &'c Connection<S>,
        session: &'c S,
    ) -> Result<DispatchFuture<'c>, PacketError> {
        (descriptor.dispatch)(reader, self.allow_trailing_bytes, connection, session)
    }

    pub fn len(&self) -> usize {
        self.plain.len() + self.extended.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_connected(&self, connection: &Connection<S>) {
        if let Some(hook) = &self.on_connected {
            hook.call(connection);
        }
    }

    pub fn on_disconnected(&self, connection: &Connection<S>) {
        if let Some(hook) = &self.on_disconnected {
            hook.call(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Login,
        Game,
    }

    struct Probe;

    impl Session for Probe {
        type State = Phase;

        fn id(&self) -> SessionId {
            SessionId(1)
        }

        fn state(&self) -> Phase {
            Phase::Login
        }
    }

    #[derive(Default)]
    struct Noop;

    impl IncomingPacket<Probe> for Noop {
        async fn process(
            self,
            _connection: &Connection<Probe>,
            _session: &Probe,
        ) -> Result<PacketOutcome, PacketError> {
            Ok(PacketOutcome::Continue)
        }
    }

    #[derive(Default)]
    struct Other;

    impl IncomingPacket<Probe> for Other {
        async fn process(
            self,
            _connection: &Connection<Probe>,
            _session: &Probe,
        ) -> Result<PacketOutcome, PacketError> {
            Ok(PacketOutcome::Disconnect)
        }
    }

    #[test]
    fn test_resolve_plain_and_extended() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register::<Noop>(0x01);
        builder.register_extended::<Other>(0xD0, 0x12);
        let registry = builder.build().unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.resolve(PacketCode::new(0x01)).is_some());
        assert!(registry.resolve(PacketCode::new(0x02)).is_none());
        let extended = registry.resolve(PacketCode::extended(0xD0, 0x12)).unwrap();
        assert!(extended.name().ends_with("Other"));
        assert!(registry.resolve(PacketCode::extended(0xD0, 0x13)).is_none());
    }

    #[test]
    fn test_read_code_one_byte_opcode() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register::<Noop>(0x01);
        builder.register_extended::<Other>(0xD0, 0x0012);
        let registry = builder.build().unwrap();

        let mut reader = PacketReader::new(&[0x01, 0xFF]);
        assert_eq!(registry.read_code(&mut reader).unwrap(), PacketCode::new(0x01));
        assert_eq!(reader.remaining(), 1);

        let mut reader = PacketReader::new(&[0xD0, 0x12, 0x00, 0xFF]);
        assert_eq!(
            registry.read_code(&mut reader).unwrap(),
            PacketCode::extended(0xD0, 0x12)
        );
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_read_code_two_byte_opcode() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.opcode_width(OpcodeWidth::U16).register::<Noop>(0x0102);
        let registry = builder.build().unwrap();

        let mut reader = PacketReader::new(&[0x02, 0x01]);
        assert_eq!(
            registry.read_code(&mut reader).unwrap(),
            PacketCode::new(0x0102)
        );
    }

    #[test]
    fn test_truncated_extended_code_is_read_error() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register_extended::<Other>(0xD0, 0x01);
        let registry = builder.build().unwrap();

        let mut reader = PacketReader::new(&[0xD0, 0x01]);
        assert!(matches!(
            registry.read_code(&mut reader),
            Err(ReadError::UnexpectedEnd { needed: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register::<Noop>(0x05);
        builder.register::<Other>(0x05);
        assert_eq!(
            builder.build().err(),
            Some(RegistryError::DuplicateCode(PacketCode::new(0x05)))
        );

        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register_extended::<Noop>(0xD0, 1);
        builder.register_extended::<Other>(0xD0, 1);
        assert_eq!(
            builder.build().err(),
            Some(RegistryError::DuplicateCode(PacketCode::extended(0xD0, 1)))
        );
    }

    #[test]
    fn test_plain_and_extended_conflict_rejected() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register_extended::<Noop>(0xD0, 1);
        builder.register::<Other>(0xD0);
        assert_eq!(
            builder.build().err(),
            Some(RegistryError::ExtendedConflict { opcode: 0xD0 })
        );
    }

    #[test]
    fn test_opcode_wider_than_field_rejected() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register::<Noop>(0x100);
        assert!(matches!(
            builder.build(),
            Err(RegistryError::OpcodeOutOfRange { opcode: 0x100, .. })
        ));
    }

    #[test]
    fn test_allowed_states() {
        let mut builder = PacketRegistry::<Probe>::builder();
        builder.register::<Noop>(0x01).allowed_states([Phase::Game]);
        builder.register::<Other>(0x02);
        let registry = builder.build().unwrap();

        let gated = registry.resolve(PacketCode::new(0x01)).unwrap();
        assert!(!gated.is_allowed_in(Phase::Login));
        assert!(gated.is_allowed_in(Phase::Game));

        let open = registry.resolve(PacketCode::new(0x02)).unwrap();
        assert!(open.is_allowed_in(Phase::Login));
        assert!(open.is_allowed_in(Phase::Game));
    }
}
