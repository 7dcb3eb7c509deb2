//! Packet framing and a sequence-matched request/response engine for a host
//! <-> embedded motor-controller RPC link.
//!
//! Three layers, each usable on its own:
//!
//! - [`crc`] — the CRC-8 and CRC-16 routines the wire format checksums with.
//! - [`framer`] — [`framer::PacketWrapper`] / [`framer::PacketUnwrapper`]
//!   adapt a byte-oriented transport ([`transport::AsyncByteSink`] /
//!   [`transport::AsyncByteSource`]) into a datagram-oriented one
//!   ([`transport::PacketSink`] / [`transport::PacketSource`]).
//! - [`endpoint`] — [`endpoint::EndpointProtocol`] multiplexes requests and
//!   replies over a packet transport by sequence number.
//!
//! Transports that are already datagram-oriented (USB bulk, a ring buffer
//! with known packet boundaries) implement [`transport::PacketSink`] /
//! [`transport::PacketSource`] directly and skip the framer.
//!
//! # Examples
//!
//! ```
//! use mlink_proto::endpoint::EndpointProtocolBuilder;
//! use mlink_proto::framer::{PacketUnwrapper, PacketWrapper};
//! use mlink_proto::transport::testing::byte_pipe_pair;
//! use mlink_proto::transport::{PacketRecv, PacketSink, PacketSource};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (host, device) = byte_pipe_pair(4096);
//! let (host_reader, host_writer) = host.into_split();
//! let (device_reader, device_writer) = device.into_split();
//!
//! // A stand-in device that echoes every request's payload straight back.
//! tokio::spawn(async move {
//!     let mut source = PacketUnwrapper::new(device_reader);
//!     let mut sink = PacketWrapper::new(device_writer);
//!     let mut buf = [0u8; 127];
//!     loop {
//!         match source.recv(&mut buf).await {
//!             PacketRecv::Ok(len) => {
//!                 if sink.send(&buf[..len]).await != mlink_proto::transport::TransferStatus::Ok {
//!                     return;
//!                 }
//!             }
//!             _ => return,
//!         }
//!     }
//! });
//!
//! let (endpoint, _join) = EndpointProtocolBuilder::new()
//!     .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));
//!
//! let invocation = endpoint.invoke(1, &b"move 10"[..]).await.unwrap();
//! let reply = invocation.await.unwrap();
//! assert_eq!(&reply[..], b"move 10");
//! # }
//! ```

pub mod crc;
pub mod endpoint;
pub mod error;
pub mod framer;
pub mod transport;


pub use endpoint::{EndpointProtocol, EndpointProtocolBuilder, Invocation, TransferHandle};
pub use error::{EndpointError, FrameError};
pub use framer::{FramedPacketTransport, PacketUnwrapper, PacketWrapper};
