// ABOUTME: Packet framer: adapts a byte-oriented sink/source into a datagram-oriented one
// ABOUTME: Wire format: [SYNC][LEN][HDR_CRC8][payload...][CRC16_HI][CRC16_LO]

use crate::crc::{crc16, crc8};
use crate::error::FrameError;
use crate::transport::{AsyncByteSink, AsyncByteSource, PacketSink, PacketSource, PacketRecv, TransferStatus};

/// First byte of every frame on the wire.
pub const SYNC: u8 = 0xAA;

/// Largest payload the framer will wrap or unwrap.
pub const MAX_PAYLOAD: usize = 127;

/// Adapts a byte sink into a [`PacketSink`] by prepending the 3-byte header
/// and appending the 2-byte CRC-16 trailer.
///
/// States the original design names (`Idle`, `SendingHeader`,
/// `SendingPayload`, `SendingTrailer`, `Cancelling`) are represented
/// implicitly by where the `write_packet` future is suspended; there is no
/// explicit `enum State` field (see `DESIGN.md`).
pub struct PacketWrapper<W> {
    inner: W,
}

impl<W: AsyncByteSink> PacketWrapper<W> {
    pub fn new(inner: W) -> Self {
        PacketWrapper { inner }
    }

    /// Write one packet: header, payload, trailer, in strict order. Each
    /// stage begins only after the previous stage's write future resolves.
    #[tracing::instrument(level = "trace", skip(self, payload), fields(len = payload.len()))]
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::BufferTooSmall);
        }

        let mut header = [0u8; 3];
        header[0] = SYNC;
        header[1] = payload.len() as u8;
        header[2] = crc8(&header[..2]);
        self.write_stage(&header).await?;

        if !payload.is_empty() {
            self.write_stage(payload).await?;
        }

        let trailer = crc16(payload).to_be_bytes();
        self.write_stage(&trailer).await?;

        Ok(())
    }

    async fn write_stage(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        let transfer = self.inner.write(buf).await;
        match transfer.status {
            TransferStatus::Ok if transfer.len == buf.len() => Ok(()),
            TransferStatus::Ok => {
                tracing::warn!(expected = buf.len(), got = transfer.len, "short write");
                Err(FrameError::Error)
            }
            TransferStatus::Closed => Err(FrameError::Closed),
            TransferStatus::Cancelled => Err(FrameError::Cancelled),
            TransferStatus::Error => Err(FrameError::Error),
        }
    }

    /// Cancel the write currently in flight, if any. Moves to `Cancelling`;
    /// the in-flight `write_packet` call resolves with `Cancelled` unless
    /// completion had already raced ahead of the cancellation.
    pub fn cancel_write(&mut self) {
        self.inner.cancel_write();
    }
}

impl<W: AsyncByteSink> PacketSink for PacketWrapper<W> {
    async fn send(&mut self, payload: &[u8]) -> TransferStatus {
        match self.write_packet(payload).await {
            Ok(()) => TransferStatus::Ok,
            Err(FrameError::Closed) => TransferStatus::Closed,
            Err(FrameError::Cancelled) => TransferStatus::Cancelled,
            Err(FrameError::BufferTooSmall | FrameError::BadFrame | FrameError::Error) => {
                TransferStatus::Error
            }
        }
    }

    fn cancel_send(&mut self) {
        self.cancel_write();
    }
}

/// Adapts a byte source into a [`PacketSource`] by stripping and validating
/// the wire framing.
///
/// Resync policy: a bad *header* (wrong sync byte, bad header CRC, or a
/// length byte with the reserved MSB set) is discarded and the next 3-byte
/// read starts immediately at the next byte the transport yields — there is
/// no byte-at-a-time shift-and-retry. This is safe only because the
/// transports this crate is meant to sit on are either already
/// datagram-aligned or polled from a ring buffer with known boundaries. A
/// bad *trailer* (payload CRC mismatch) is reported once as
/// [`FrameError::BadFrame`] to the caller, who is expected to call
/// `read_packet` again — this mirrors how the endpoint engine's RX pump
/// treats per-packet errors as non-fatal.
pub struct PacketUnwrapper<R> {
    inner: R,
}

impl<R: AsyncByteSource> PacketUnwrapper<R> {
    pub fn new(inner: R) -> Self {
        PacketUnwrapper { inner }
    }

    /// Read one packet's payload into `buf`, returning the payload length.
    #[tracing::instrument(level = "trace", skip(self, buf))]
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, FrameError> {
        loop {
            let mut header = [0u8; 3];
            match self.read_stage(&mut header).await {
                Ok(()) => {}
                Err(e) => return Err(e),
            }

            let len = header[1] as usize;
            if header[0] != SYNC || len > MAX_PAYLOAD || header[2] != crc8(&header[..2]) {
                tracing::warn!("bad header, resyncing");
                continue;
            }

            if len > buf.len() {
                return Err(FrameError::BufferTooSmall);
            }

            self.read_stage(&mut buf[..len]).await?;

            let mut trailer = [0u8; 2];
            self.read_stage(&mut trailer).await?;

            let expected = crc16(&buf[..len]);
            let received = u16::from_be_bytes(trailer);
            if expected != received {
                tracing::warn!("payload CRC mismatch");
                return Err(FrameError::BadFrame);
            }

            return Ok(len);
        }
    }

    async fn read_stage(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        let transfer = self.inner.read(buf).await;
        match transfer.status {
            TransferStatus::Ok if transfer.len == buf.len() => Ok(()),
            TransferStatus::Ok => {
                tracing::warn!(expected = buf.len(), got = transfer.len, "short read");
                Err(FrameError::Error)
            }
            TransferStatus::Closed => Err(FrameError::Closed),
            TransferStatus::Cancelled => Err(FrameError::Cancelled),
            TransferStatus::Error => Err(FrameError::Error),
        }
    }

    pub fn cancel_read(&mut self) {
        self.inner.cancel_read();
    }
}

impl<R: AsyncByteSource> PacketSource for PacketUnwrapper<R> {
    async fn recv(&mut self, buf: &mut [u8]) -> PacketRecv {
        match self.read_packet(buf).await {
            Ok(len) => PacketRecv::Ok(len),
            Err(FrameError::BadFrame | FrameError::BufferTooSmall) => PacketRecv::BadFrame,
            Err(FrameError::Closed) => PacketRecv::Closed,
            Err(FrameError::Cancelled | FrameError::Error) => PacketRecv::Error,
        }
    }
}

/// Composes a [`PacketWrapper`] and [`PacketUnwrapper`] over a pair of byte
/// transports into one type implementing both [`PacketSink`] and
/// [`PacketSource`].
///
/// Links that are already datagram-oriented (e.g. USB bulk) implement
/// [`PacketSink`]/[`PacketSource`] directly and skip this adapter entirely.
pub struct FramedPacketTransport<R, W> {
    unwrapper: PacketUnwrapper<R>,
    wrapper: PacketWrapper<W>,
}

impl<R: AsyncByteSource, W: AsyncByteSink> FramedPacketTransport<R, W> {
    pub fn new(source: R, sink: W) -> Self {
        FramedPacketTransport {
            unwrapper: PacketUnwrapper::new(source),
            wrapper: PacketWrapper::new(sink),
        }
    }
}

impl<R: AsyncByteSource, W: AsyncByteSink + Send> PacketSink for FramedPacketTransport<R, W> {
    async fn send(&mut self, payload: &[u8]) -> TransferStatus {
        self.wrapper.send(payload).await
    }

    fn cancel_send(&mut self) {
        self.wrapper.cancel_send();
    }
}

impl<R: AsyncByteSource + Send, W: AsyncByteSink> PacketSource for FramedPacketTransport<R, W> {
    async fn recv(&mut self, buf: &mut [u8]) -> PacketRecv {
        self.unwrapper.recv(buf).await
    }
}
