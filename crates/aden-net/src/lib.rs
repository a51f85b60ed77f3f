//! Connection acceptor, session registry, and packet dispatch pipeline shared
//! by every server role.

pub mod cipher;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod listener;
pub mod packet;
pub mod platform;
pub mod registry;
pub mod session;
pub mod transform;


pub use cipher::XorCipher;
pub use codec::{CodecError, FrameConfig, FrameDecoder, FrameEncoder, PacketCodec};
pub use compression::{CompressionConfig, Lz4Compression};
pub use connection::{Connection, ConnectionOptions, SendError};
pub use listener::{Listener, ListenerConfig, ListenerError};
pub use packet::{
    IncomingPacket, OutgoingPacket, PacketCode, PacketError, PacketOutcome, PacketReader,
    PacketWriter, ReadError,
};
pub use platform::SocketConfig;
pub use registry::{OpcodeWidth, PacketRegistry, RegistryBuilder, RegistryError};
pub use session::{PacketCodecFactory, Session, SessionFactory, SessionId, SessionIdGenerator};
pub use transform::{PacketTransform, TransformError};
