// ABOUTME: Sequence-matched request/response engine multiplexed over a PacketSink/PacketSource
// ABOUTME: Runs as a background actor task; EndpointProtocol is a cheap, cloneable handle to it

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::error::EndpointError;
use crate::transport::{PacketRecv, PacketSink, PacketSource, TransferStatus};

/// Wire header carried inside every packet payload, ahead of the
/// application bytes: a 16-bit sequence number followed by a 16-bit
/// endpoint id whose top bit is the ack-request flag. Both fields are
/// little-endian.
const PACKET_HEADER_LEN: usize = 4;
const ENDPOINT_ACK_FLAG: u16 = 0x8000;

/// Outcome of one completed (or failed) operation.
pub type OperationOutcome = Result<Bytes, EndpointError>;

fn encode_request(seqno: u16, endpoint_id: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
    buf.extend_from_slice(&seqno.to_le_bytes());
    buf.extend_from_slice(&(endpoint_id | ENDPOINT_ACK_FLAG).to_le_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn decode_reply(buf: &[u8]) -> Option<(u16, u16, &[u8])> {
    if buf.len() < PACKET_HEADER_LEN {
        return None;
    }
    let seqno = u16::from_le_bytes([buf[0], buf[1]]);
    let endpoint_id = u16::from_le_bytes([buf[2], buf[3]]);
    Some((seqno, endpoint_id, &buf[PACKET_HEADER_LEN..]))
}

/// One in-flight request: the bytes already on the wire (or about to be),
/// and the channel its eventual outcome is delivered through.
struct Operation {
    seqno: u16,
    #[allow(dead_code)] // kept for diagnostics / future use matching replies against the request's endpoint
    endpoint_id: u16,
    tx_payload: Bytes,
    outcome: oneshot::Sender<OperationOutcome>,
}

enum Command {
    Invoke {
        endpoint_id: u16,
        payload: Bytes,
        admit: oneshot::Sender<Result<Invocation, EndpointError>>,
    },
    Cancel {
        seqno: u16,
    },
}

/// A cancellation handle for one outstanding operation, mirroring
/// [`tokio::task::JoinHandle`]'s relationship to a spawned task: it can be
/// held and used to cancel independently of awaiting the operation's
/// outcome.
#[derive(Clone)]
pub struct TransferHandle {
    seqno: u16,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TransferHandle {
    /// Request cancellation of this operation. A no-op if it has already
    /// completed.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::Cancel { seqno: self.seqno });
    }
}

/// The future returned by [`EndpointProtocol::invoke`]'s admission step.
///
/// `Invocation` is itself a future that resolves to the operation's
/// outcome, but — unlike a plain `async fn` — also exposes a synchronous
/// [`Invocation::handle`] so a caller can retain a cancellation handle
/// without holding on to (or polling) the `Invocation` itself.
pub struct Invocation {
    seqno: u16,
    cmd_tx: mpsc::UnboundedSender<Command>,
    outcome_rx: oneshot::Receiver<OperationOutcome>,
}

impl Invocation {
    fn new(
        seqno: u16,
        cmd_tx: mpsc::UnboundedSender<Command>,
        outcome_rx: oneshot::Receiver<OperationOutcome>,
    ) -> Self {
        Invocation { seqno, cmd_tx, outcome_rx }
    }

    /// A cancellation handle for this operation.
    pub fn handle(&self) -> TransferHandle {
        TransferHandle { seqno: self.seqno, cmd_tx: self.cmd_tx.clone() }
    }
}

impl Future for Invocation {
    type Output = OperationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.outcome_rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EndpointError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A cloneable handle to a running endpoint engine.
///
/// Cloning is cheap (an `mpsc::UnboundedSender` clone); every clone talks to
/// the same background actor task.
#[derive(Clone)]
pub struct EndpointProtocol {
    cmd_tx: mpsc::UnboundedSender<Command>,
    mtu: usize,
}

impl EndpointProtocol {
    /// Submit a request to `endpoint_id` carrying `payload`.
    ///
    /// This performs one quick round trip to the engine's actor task to
    /// check admission (both the transmit slot and the single-depth queue
    /// slot must not already be occupied) before returning an
    /// [`Invocation`] — this avoids the time-of-check/time-of-use race a
    /// synchronous, engine-side-only admission check would have against a
    /// concurrently completing transmit.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(endpoint_id))]
    pub async fn invoke(
        &self,
        endpoint_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<Invocation, EndpointError> {
        let payload = payload.into();
        if PACKET_HEADER_LEN + payload.len() > self.mtu {
            return Err(EndpointError::BufferTooSmall);
        }

        let (admit_tx, admit_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Invoke { endpoint_id, payload, admit: admit_tx })
            .map_err(|_| EndpointError::Closed)?;

        admit_rx.await.map_err(|_| EndpointError::Closed)?
    }
}

/// Default number of outstanding replies the engine's `expected_acks` map is
/// pre-sized for, chosen to cover the transmit slot plus the queue slot
/// plus a little headroom without repeated reallocation during normal use.
const DEFAULT_EXPECTED_ACKS_CAPACITY: usize = 4;

/// Configures and spawns an endpoint engine over a packet transport.
pub struct EndpointProtocolBuilder {
    mtu: usize,
    expected_acks_capacity: usize,
}

impl Default for EndpointProtocolBuilder {
    fn default() -> Self {
        EndpointProtocolBuilder {
            mtu: crate::framer::MAX_PAYLOAD,
            expected_acks_capacity: DEFAULT_EXPECTED_ACKS_CAPACITY,
        }
    }
}

impl EndpointProtocolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap outgoing packet payloads (header + application bytes) to `mtu`
    /// bytes. Clamped to [`crate::framer::MAX_PAYLOAD`], the framer's own
    /// hard limit.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.min(crate::framer::MAX_PAYLOAD);
        self
    }

    /// Pre-size the map of replies the engine is waiting on, to avoid
    /// reallocating it under load from callers that routinely keep more
    /// than a couple of operations in flight via overlapping `cancel`s and
    /// re-`invoke`s. Purely a capacity hint; the map grows past it anyway.
    pub fn with_expected_acks_capacity(mut self, capacity: usize) -> Self {
        self.expected_acks_capacity = capacity;
        self
    }

    /// Spawn the engine's background actor task, taking ownership of
    /// `sink` and `source`. Returns a cloneable handle plus the task's
    /// `JoinHandle`, which resolves once the transport closes and every
    /// outstanding operation has been completed with `Closed`.
    pub fn spawn<Si, So>(self, sink: Si, source: So) -> (EndpointProtocol, tokio::task::JoinHandle<()>)
    where
        Si: PacketSink + 'static,
        So: PacketSource + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run(sink, source, cmd_tx.clone(), cmd_rx, self.expected_acks_capacity));
        (EndpointProtocol { cmd_tx, mtu: self.mtu }, join)
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Takes `sink` behind a shared handle (rather than `&mut Si` borrowed from
/// the enclosing loop) so the returned future has no borrow of the caller's
/// stack frame — storing a `&mut`-borrowing future in a loop-local slot that
/// gets reassigned across iterations runs into the borrow checker's
/// invariant-lifetime handling of `Pin<Box<dyn Future + '_>>`. Access is
/// always sequential (only one send future is ever in flight at a time), so
/// the lock is never contended; this is purely a borrow-shape fix, not a
/// behavior change.
async fn drive_send<Si: PacketSink + 'static>(sink: Arc<tokio::sync::Mutex<Si>>, payload: Bytes) -> TransferStatus {
    let mut guard = sink.lock().await;
    guard.send(&payload).await
}

/// Owns `buf` for the duration of the receive and hands it back alongside
/// the outcome, so the future holds no borrow of it once awaited — the
/// caller is free to read `buf` and then move it into the next receive.
async fn drive_recv<So: PacketSource>(source: &mut So, mut buf: Vec<u8>) -> (PacketRecv, Vec<u8>) {
    let recv = source.recv(&mut buf).await;
    (recv, buf)
}

async fn run<Si, So>(
    sink: Si,
    mut source: So,
    cmd_tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    expected_acks_capacity: usize,
)
where
    Si: PacketSink + 'static,
    So: PacketSource,
{
    let sink = Arc::new(tokio::sync::Mutex::new(sink));
    let mut outbound_seqno: u16 = 0;
    let mut tx_busy: Option<Operation> = None;
    let mut pending: Option<Operation> = None;
    let mut expected_acks: HashMap<u16, Operation> = HashMap::with_capacity(expected_acks_capacity);

    let mut tx_fut: Option<BoxFuture<'static, TransferStatus>> = None;
    let rx_buf = vec![0u8; crate::framer::MAX_PAYLOAD];
    let mut rx_fut: BoxFuture<'_, (PacketRecv, Vec<u8>)> = Box::pin(drive_recv(&mut source, rx_buf));

    let fail_all = |tx_busy: &mut Option<Operation>,
                    pending: &mut Option<Operation>,
                    expected_acks: &mut HashMap<u16, Operation>,
                    err: EndpointError| {
        for op in tx_busy.take().into_iter().chain(pending.take()).chain(expected_acks.drain().map(|(_, op)| op))
        {
            let _ = op.outcome.send(Err(err));
        }
    };

    'engine: loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break 'engine,
                    Some(Command::Invoke { endpoint_id, payload, admit }) => {
                        if tx_busy.is_some() && pending.is_some() {
                            let _ = admit.send(Err(EndpointError::Busy));
                            continue 'engine;
                        }

                        let seqno = outbound_seqno;
                        outbound_seqno = outbound_seqno.wrapping_add(1);

                        let (outcome_tx, outcome_rx) = oneshot::channel();
                        let tx_payload = encode_request(seqno, endpoint_id, &payload);
                        let op = Operation { seqno, endpoint_id, tx_payload, outcome: outcome_tx };

                        let invocation = Invocation::new(seqno, cmd_tx.clone(), outcome_rx);
                        let _ = admit.send(Ok(invocation));

                        if tx_busy.is_none() {
                            tx_busy = Some(op);
                        } else {
                            pending = Some(op);
                        }
                        tracing::trace!(seqno, "admitted operation");
                    }
                    Some(Command::Cancel { seqno }) => {
                        if pending.as_ref().is_some_and(|op| op.seqno == seqno) {
                            let op = pending.take().unwrap();
                            let _ = op.outcome.send(Err(EndpointError::Cancelled));
                        } else if tx_busy.as_ref().is_some_and(|op| op.seqno == seqno) {
                            let op = tx_busy.take().unwrap();
                            tx_fut = None;
                            let _ = op.outcome.send(Err(EndpointError::Cancelled));
                        } else if let Some(op) = expected_acks.remove(&seqno) {
                            let _ = op.outcome.send(Err(EndpointError::Cancelled));
                        }
                    }
                }
            }

            status = async {
                match tx_fut.as_mut() {
                    Some(fut) => fut.await,
                    None => std::future::pending().await,
                }
            } => {
                tx_fut = None;
                let op = tx_busy.take().expect("tx_fut only set while tx_busy is occupied");
                match status {
                    TransferStatus::Ok => {
                        tracing::trace!(seqno = op.seqno, "transmit complete, awaiting reply");
                        if let Some(evicted) = expected_acks.insert(op.seqno, op) {
                            tracing::warn!(seqno = evicted.seqno, "sequence number wrapped onto an outstanding operation");
                            let _ = evicted.outcome.send(Err(EndpointError::Error));
                        }
                    }
                    TransferStatus::Closed => {
                        let _ = op.outcome.send(Err(EndpointError::Closed));
                        fail_all(&mut tx_busy, &mut pending, &mut expected_acks, EndpointError::Closed);
                        break 'engine;
                    }
                    TransferStatus::Cancelled => {
                        let _ = op.outcome.send(Err(EndpointError::Cancelled));
                    }
                    TransferStatus::Error => {
                        let _ = op.outcome.send(Err(EndpointError::Error));
                    }
                }
            }

            (recv, rx_buf) = &mut rx_fut => {
                match recv {
                    PacketRecv::Ok(len) => {
                        if let Some((seqno, _endpoint_id, reply_payload)) = decode_reply(&rx_buf[..len]) {
                            if let Some(op) = expected_acks.remove(&seqno) {
                                let _ = op.outcome.send(Ok(Bytes::copy_from_slice(reply_payload)));
                            } else {
                                tracing::debug!(seqno, "reply with no matching outstanding operation");
                            }
                        } else {
                            tracing::warn!(len, "reply shorter than the packet header");
                        }
                        drop(rx_fut);
                        rx_fut = Box::pin(drive_recv(&mut source, rx_buf));
                    }
                    PacketRecv::BadFrame => {
                        tracing::debug!("bad frame, resuming receive");
                        drop(rx_fut);
                        rx_fut = Box::pin(drive_recv(&mut source, rx_buf));
                    }
                    PacketRecv::Closed => {
                        fail_all(&mut tx_busy, &mut pending, &mut expected_acks, EndpointError::Closed);
                        break 'engine;
                    }
                    PacketRecv::Error => {
                        fail_all(&mut tx_busy, &mut pending, &mut expected_acks, EndpointError::Error);
                        break 'engine;
                    }
                }
            }
        }

        if tx_fut.is_none() && tx_busy.is_none() {
            tx_busy = pending.take();
        }
        if tx_fut.is_none() {
            if let Some(op) = tx_busy.as_ref() {
                tx_fut = Some(Box::pin(drive_send(Arc::clone(&sink), op.tx_payload.clone())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{PacketUnwrapper, PacketWrapper, MAX_PAYLOAD};
    use crate::transport::testing::byte_pipe_pair;

    /// Spawns a background task that plays the device side: for every
    /// request it receives, it echoes the sequence number and endpoint id
    /// back with `reply` as the payload.
    fn spawn_echo_device(
        mut source: impl PacketSource + 'static,
        mut sink: impl PacketSink + 'static,
        reply: &'static [u8],
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PAYLOAD];
            loop {
                match source.recv(&mut buf).await {
                    PacketRecv::Ok(len) => {
                        let Some((seqno, endpoint_id, _payload)) = decode_reply(&buf[..len]) else {
                            continue;
                        };
                        let response = encode_request(seqno, endpoint_id, reply);
                        // encode_request also sets the ack flag; the device
                        // doesn't care, only the seqno/endpoint_id bytes matter here.
                        if sink.send(&response).await != TransferStatus::Ok {
                            return;
                        }
                    }
                    PacketRecv::BadFrame => continue,
                    PacketRecv::Closed | PacketRecv::Error => return,
                }
            }
        });
    }

    fn spawn_endpoint(reply: &'static [u8]) -> EndpointProtocol {
        let (host, device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (device_reader, device_writer) = device.into_split();

        spawn_echo_device(
            PacketUnwrapper::new(device_reader),
            PacketWrapper::new(device_writer),
            reply,
        );

        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));
        endpoint
    }

    #[tokio::test]
    async fn invoke_round_trips_to_an_echoing_device() {
        let endpoint = spawn_endpoint(b"pong");
        let invocation = endpoint.invoke(7, Bytes::from_static(b"ping")).await.unwrap();
        let reply = invocation.await.unwrap();
        assert_eq!(&reply[..], b"pong");
    }

    #[tokio::test]
    async fn two_outstanding_invokes_are_matched_by_sequence_number_even_if_replies_reorder() {
        let (host, device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (device_reader, device_writer) = device.into_split();

        // Device that replies to the *second* request it sees before the first.
        tokio::spawn(async move {
            let mut source = PacketUnwrapper::new(device_reader);
            let mut sink = PacketWrapper::new(device_writer);
            let mut buf = [0u8; MAX_PAYLOAD];

            let PacketRecv::Ok(len) = source.recv(&mut buf).await else { return };
            let (seqno_a, endpoint_a, _) = decode_reply(&buf[..len]).unwrap();

            let PacketRecv::Ok(len) = source.recv(&mut buf).await else { return };
            let (seqno_b, endpoint_b, _) = decode_reply(&buf[..len]).unwrap();

            sink.send(&encode_request(seqno_b, endpoint_b, b"second")).await;
            sink.send(&encode_request(seqno_a, endpoint_a, b"first")).await;
        });

        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        let first = endpoint.invoke(1, Bytes::from_static(b"a")).await.unwrap();
        let second = endpoint.invoke(2, Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(&second.await.unwrap()[..], b"second");
        assert_eq!(&first.await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn third_invoke_is_rejected_busy_while_two_are_already_outstanding() {
        // A one-byte duplex buffer with nothing draining the other end means
        // the first operation's write blocks forever partway through,
        // keeping the transmit slot occupied and forcing the second
        // operation into the single queue slot.
        let (host, _device) = byte_pipe_pair(1);
        let (host_reader, host_writer) = host.into_split();
        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        let _first = endpoint.invoke(1, Bytes::from_static(b"a")).await.unwrap();
        let _second = endpoint.invoke(2, Bytes::from_static(b"b")).await.unwrap();
        let third = endpoint.invoke(3, Bytes::from_static(b"c")).await;
        assert_eq!(third.err(), Some(EndpointError::Busy));
    }

    #[tokio::test]
    async fn cancelling_a_queued_operation_completes_it_with_cancelled() {
        let (host, _device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        let _first = endpoint.invoke(1, Bytes::from_static(b"a")).await.unwrap();
        let second = endpoint.invoke(2, Bytes::from_static(b"b")).await.unwrap();
        second.handle().cancel();

        assert_eq!(second.await, Err(EndpointError::Cancelled));
    }

    #[tokio::test]
    async fn dropping_the_device_end_closes_every_outstanding_operation() {
        let (host, device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        let invocation = endpoint.invoke(1, Bytes::from_static(b"a")).await.unwrap();
        drop(device);

        assert_eq!(invocation.await, Err(EndpointError::Closed));
        assert_eq!(
            endpoint.invoke(2, Bytes::from_static(b"b")).await.err(),
            Some(EndpointError::Closed)
        );
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_without_a_round_trip_to_the_actor() {
        let endpoint = spawn_endpoint(b"unused");
        let huge = vec![0u8; MAX_PAYLOAD];
        assert_eq!(
            endpoint.invoke(1, Bytes::from(huge)).await.err(),
            Some(EndpointError::BufferTooSmall)
        );
    }

    #[tokio::test]
    async fn a_narrower_mtu_rejects_payloads_the_framer_itself_would_still_accept() {
        let (host, _device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .with_mtu(8)
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        // 4-byte header + 5-byte payload exceeds the configured 8-byte mtu.
        assert_eq!(
            endpoint.invoke(1, Bytes::from_static(b"12345")).await.err(),
            Some(EndpointError::BufferTooSmall)
        );
        assert!(endpoint.invoke(1, Bytes::from_static(b"1234")).await.is_ok());
    }

    #[test]
    fn with_mtu_clamps_above_the_framer_hard_limit() {
        let builder = EndpointProtocolBuilder::new().with_mtu(usize::MAX);
        assert_eq!(builder.mtu, MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn a_narrowed_mtu_still_receives_a_full_size_reply_from_an_unrestricted_peer() {
        let (host, device) = byte_pipe_pair(4096);
        let (host_reader, host_writer) = host.into_split();
        let (device_reader, device_writer) = device.into_split();

        // The device isn't mtu-limited and replies with a payload that fills
        // the framer's full 127-byte limit, well past the host's narrow mtu.
        let reply: &'static [u8] = Box::leak(vec![0xABu8; MAX_PAYLOAD - PACKET_HEADER_LEN].into_boxed_slice());
        spawn_echo_device(
            PacketUnwrapper::new(device_reader),
            PacketWrapper::new(device_writer),
            reply,
        );

        let (endpoint, _join) = EndpointProtocolBuilder::new()
            .with_mtu(8)
            .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

        let invocation = endpoint.invoke(1, Bytes::from_static(b"1234")).await.unwrap();
        assert_eq!(&invocation.await.unwrap()[..], reply);
    }
}
