// ABOUTME: Capability contracts the framer and endpoint engine consume from the physical transport
// ABOUTME: Also hosts in-memory mock transports used by tests, benches, and the loopback demo

use std::future::Future;

/// Outcome of one submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer completed in full.
    Ok,
    /// The underlying link is closed; no further transfers will complete.
    Closed,
    /// The transfer was cancelled before completion.
    Cancelled,
    /// Any other transport failure.
    Error,
}

/// Result of one byte-level transfer: the status plus how many bytes were
/// actually moved (meaningful even on `Cancelled`, if the transfer raced to
/// completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub status: TransferStatus,
    pub len: usize,
}

impl Transfer {
    pub(crate) fn ok(len: usize) -> Self {
        Transfer { status: TransferStatus::Ok, len }
    }
}

/// A byte sink capable of one outstanding write at a time.
///
/// Implementations own the underlying link for as long as they are held by
/// the framer; `write` must not be called again until the previous call's
/// future has resolved.
pub trait AsyncByteSink: Send {
    /// Write `buf` in full, or stop short on `Closed`/`Cancelled`/`Error`.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = Transfer> + Send;

    /// Request cancellation of the write currently in flight. A no-op if no
    /// write is outstanding. The in-flight `write` future still resolves
    /// exactly once, with `Cancelled` unless completion had already raced
    /// ahead of the cancellation.
    fn cancel_write(&mut self);
}

/// A byte source capable of one outstanding read at a time.
pub trait AsyncByteSource: Send {
    /// Fill `buf` in full, or stop short on `Closed`/`Cancelled`/`Error`.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Transfer> + Send;

    /// Request cancellation of the read currently in flight. A no-op if no
    /// read is outstanding.
    fn cancel_read(&mut self);
}

impl<T: AsyncByteSink + ?Sized> AsyncByteSink for &mut T {
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = Transfer> + Send {
        (**self).write(buf)
    }

    fn cancel_write(&mut self) {
        (**self).cancel_write();
    }
}

impl<T: AsyncByteSource + ?Sized> AsyncByteSource for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Transfer> + Send {
        (**self).read(buf)
    }

    fn cancel_read(&mut self) {
        (**self).cancel_read();
    }
}

/// Outcome of one packet receive: either a decoded payload length, a
/// non-fatal framing error the caller should log and retry past, or a
/// terminal transport condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRecv {
    /// `buf[..len]` holds the received payload.
    Ok(usize),
    /// Sync byte, header CRC, or payload CRC mismatch — non-fatal, the
    /// caller should call `recv` again.
    BadFrame,
    /// The underlying link closed.
    Closed,
    /// Any other transport failure.
    Error,
}

/// Datagram-oriented sink: one submission transfers exactly one packet.
pub trait PacketSink: Send {
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = TransferStatus> + Send;
    fn cancel_send(&mut self);
}

/// Datagram-oriented source: one submission yields exactly one packet;
/// partial-packet reads are not observable.
pub trait PacketSource: Send {
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = PacketRecv> + Send;
}

/// In-memory mock transports for tests, benches, and the loopback demo.
///
/// These stand in for the physical transport implementations this crate
/// expects to sit on top of (USB bulk endpoints, UART DMA rings) but does
/// not itself provide; they are not meant as a production transport.
pub mod testing {
    use super::{AsyncByteSink, AsyncByteSource, Transfer, TransferStatus};
    use std::io;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::Notify;

    /// One end of an in-memory byte pipe: implements both
    /// [`AsyncByteSink`] and [`AsyncByteSource`] by wrapping the read and
    /// write halves of a [`tokio::io::duplex`] pair.
    pub struct ByteEnd {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        read_cancel: Arc<Notify>,
        write_cancel: Arc<Notify>,
    }

    /// Create a connected pair of [`ByteEnd`]s: bytes written to one side's
    /// sink are readable from the other side's source, and vice versa.
    pub fn byte_pipe_pair(bufsize: usize) -> (ByteEnd, ByteEnd) {
        let (a, b) = tokio::io::duplex(bufsize);
        (ByteEnd::new(a), ByteEnd::new(b))
    }

    impl ByteEnd {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            ByteEnd {
                reader,
                writer,
                read_cancel: Arc::new(Notify::new()),
                write_cancel: Arc::new(Notify::new()),
            }
        }

        /// Split into independently-owned read and write halves, for callers
        /// (such as the endpoint engine) that need a `PacketSink` and a
        /// `PacketSource` as two distinct values rather than one combined
        /// transport.
        pub fn into_split(self) -> (ByteEndReader, ByteEndWriter) {
            (
                ByteEndReader { reader: self.reader, read_cancel: self.read_cancel },
                ByteEndWriter { writer: self.writer, write_cancel: self.write_cancel },
            )
        }
    }

    /// The read half of a [`ByteEnd`], produced by [`ByteEnd::into_split`].
    pub struct ByteEndReader {
        reader: ReadHalf<DuplexStream>,
        read_cancel: Arc<Notify>,
    }

    /// The write half of a [`ByteEnd`], produced by [`ByteEnd::into_split`].
    pub struct ByteEndWriter {
        writer: WriteHalf<DuplexStream>,
        write_cancel: Arc<Notify>,
    }

    fn classify(err: &io::Error) -> TransferStatus {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => TransferStatus::Closed,
            _ => TransferStatus::Error,
        }
    }

    impl AsyncByteSource for ByteEndReader {
        async fn read(&mut self, buf: &mut [u8]) -> Transfer {
            let cancel = self.read_cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.notified() => Transfer { status: TransferStatus::Cancelled, len: 0 },
                result = self.reader.read_exact(buf) => match result {
                    Ok(n) => Transfer::ok(n),
                    Err(e) => Transfer { status: classify(&e), len: 0 },
                },
            }
        }

        fn cancel_read(&mut self) {
            self.read_cancel.notify_waiters();
        }
    }

    impl AsyncByteSink for ByteEndWriter {
        async fn write(&mut self, buf: &[u8]) -> Transfer {
            let cancel = self.write_cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.notified() => Transfer { status: TransferStatus::Cancelled, len: 0 },
                result = self.writer.write_all(buf) => match result {
                    Ok(()) => Transfer::ok(buf.len()),
                    Err(e) => Transfer { status: classify(&e), len: 0 },
                },
            }
        }

        fn cancel_write(&mut self) {
            self.write_cancel.notify_waiters();
        }
    }

    impl AsyncByteSink for ByteEnd {
        async fn write(&mut self, buf: &[u8]) -> Transfer {
            let cancel = self.write_cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.notified() => Transfer { status: TransferStatus::Cancelled, len: 0 },
                result = self.writer.write_all(buf) => match result {
                    Ok(()) => Transfer::ok(buf.len()),
                    Err(e) => Transfer { status: classify(&e), len: 0 },
                },
            }
        }

        fn cancel_write(&mut self) {
            self.write_cancel.notify_waiters();
        }
    }

    impl AsyncByteSource for ByteEnd {
        async fn read(&mut self, buf: &mut [u8]) -> Transfer {
            let cancel = self.read_cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.notified() => Transfer { status: TransferStatus::Cancelled, len: 0 },
                result = self.reader.read_exact(buf) => match result {
                    Ok(n) => Transfer::ok(n),
                    Err(e) => Transfer { status: classify(&e), len: 0 },
                },
            }
        }

        fn cancel_read(&mut self) {
            self.read_cancel.notify_waiters();
        }
    }
}
