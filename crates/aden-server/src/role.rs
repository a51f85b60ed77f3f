//! The gate role: a handshake that agrees on the protocol revision and hands
//! out the session cipher key, followed by keepalive pings.
//!
//! | opcode | direction | packet                              | state     |
//! |--------|-----------|-------------------------------------|-----------|
//! | `0x00` | in        | `Hello { protocol: u32 }`           | Handshake |
//! | `0x01` | in        | `Ping { token: u32 }`               | Ready     |
//! | `0x02` | in        | `Quit`                              | any       |
//! | `0x00` | out       | `Welcome { accepted: u8, key: [u8; 16] }` |     |
//! | `0x01` | out       | `Pong { token: u32 }`               |           |

use std::sync::atomic::{AtomicBool, Ordering};

use aden_net::cipher::KEY_LEN;
use aden_net::{
    CompressionConfig, Connection, FrameConfig, IncomingPacket, Lz4Compression, OutgoingPacket,
    PacketCodec, PacketCodecFactory, PacketError, PacketOutcome, PacketReader, PacketRegistry,
    PacketWriter, ReadError, RegistryBuilder, RegistryError, Session, SessionFactory, SessionId,
    SessionIdGenerator, XorCipher,
};

pub const HELLO: u16 = 0x00;
pub const PING: u16 = 0x01;
pub const QUIT: u16 = 0x02;

pub const WELCOME: u8 = 0x00;
pub const PONG: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Handshake,
    Ready,
}

/// Per-client state of the gate role.
pub struct GateSession {
    id: SessionId,
    key: [u8; KEY_LEN],
    expected_protocol: u32,
    ready: AtomicBool,
}

impl GateSession {
    /// Cipher key both directions start from once the handshake completes.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl Session for GateSession {
    type State = GateState;

    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> GateState {
        if self.ready.load(Ordering::Acquire) {
            GateState::Ready
        } else {
            GateState::Handshake
        }
    }
}

/// Settings the gate role needs from the server configuration.
#[derive(Debug, Clone)]
pub struct GateOptions {
    pub protocol_version: u32,
    pub encryption: bool,
    pub compression: Option<CompressionConfig>,
    pub frame: FrameConfig,
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Hello {
    protocol: u32,
}

impl IncomingPacket<GateSession> for Hello {
    fn read_body(&mut self, reader: &mut PacketReader<'_>) -> Result<(), ReadError> {
        self.protocol = reader.read_u32()?;
        Ok(())
    }

    async fn process(
        self,
        connection: &Connection<GateSession>,
        session: &GateSession,
    ) -> Result<PacketOutcome, PacketError> {
        if self.protocol != session.expected_protocol {
            tracing::warn!(
                session = %session.id,
                "client speaks protocol {}, expected {}",
                self.protocol,
                session.expected_protocol
            );
            connection.send(&Welcome {
                accepted: false,
                key: [0; KEY_LEN],
            })?;
            return Ok(PacketOutcome::Disconnect);
        }

        connection.send(&Welcome {
            accepted: true,
            key: *session.key(),
        })?;
        session.ready.store(true, Ordering::Release);
        tracing::debug!(session = %session.id, "handshake complete");
        Ok(PacketOutcome::ActivateTransforms)
    }
}

#[derive(Default)]
struct Ping {
    token: u32,
}

impl IncomingPacket<GateSession> for Ping {
    fn read_body(&mut self, reader: &mut PacketReader<'_>) -> Result<(), ReadError> {
        self.token = reader.read_u32()?;
        Ok(())
    }

    async fn process(
        self,
        connection: &Connection<GateSession>,
        _session: &GateSession,
    ) -> Result<PacketOutcome, PacketError> {
        connection.send(&Pong { token: self.token })?;
        Ok(PacketOutcome::Continue)
    }
}

#[derive(Default)]
struct Quit;

impl IncomingPacket<GateSession> for Quit {
    async fn process(
        self,
        _connection: &Connection<GateSession>,
        session: &GateSession,
    ) -> Result<PacketOutcome, PacketError> {
        tracing::debug!(session = %session.id, "client quit");
        Ok(PacketOutcome::Disconnect)
    }
}

struct Welcome {
    accepted: bool,
    key: [u8; KEY_LEN],
}

impl OutgoingPacket for Welcome {
    fn write(&self, writer: &mut PacketWriter) {
        writer
            .write_u8(WELCOME)
            .write_bool(self.accepted)
            .write_bytes(&self.key);
    }
}

struct Pong {
    token: u32,
}

impl OutgoingPacket for Pong {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u8(PONG).write_u32(self.token);
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// The gate role's opcode table and lifecycle hooks.
pub fn registry() -> Result<PacketRegistry<GateSession>, RegistryError> {
    let mut builder = RegistryBuilder::<GateSession>::new();
    builder
        .register::<Hello>(HELLO)
        .allowed_states([GateState::Handshake]);
    builder
        .register::<Ping>(PING)
        .allowed_states([GateState::Ready]);
    builder.register::<Quit>(QUIT);

    builder.on_connected(|connection: &Connection<GateSession>| {
        tracing::info!(
            session = %connection.id(),
            peer = %connection.peer_addr(),
            "client connected"
        );
    });
    builder.on_disconnected(|connection: &Connection<GateSession>| {
        tracing::info!(
            session = %connection.id(),
            peer = %connection.peer_addr(),
            "client disconnected after {:?}",
            connection.connected_at().elapsed()
        );
    });

    builder.build()
}

/// Fresh sessions with unique ids and random cipher keys.
pub fn session_factory(options: &GateOptions) -> impl SessionFactory<GateSession> + use<> {
    let ids = SessionIdGenerator::new();
    let expected_protocol = options.protocol_version;
    move || GateSession {
        id: ids.next_id(),
        key: XorCipher::random_key(),
        expected_protocol,
        ready: AtomicBool::new(false),
    }
}

/// Codecs whose transforms stay pending until the handshake succeeds.
pub fn codec_factory(options: &GateOptions) -> impl PacketCodecFactory<GateSession> + use<> {
    let options = options.clone();
    move |session: &GateSession| {
        let mut codec = PacketCodec::new(options.frame.clone());
        if let Some(compression) = &options.compression {
            codec = codec.with_transform(Lz4Compression::new(compression.clone()));
        }
        if options.encryption {
            codec = codec.with_transform(XorCipher::new(session.key));
        }
        codec.pending()
    }
}
