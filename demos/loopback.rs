// ABOUTME: Wires an in-memory byte pipe, the packet framer, and the endpoint engine end to end
// ABOUTME: Run with `cargo run --example loopback`

use bytes::Bytes;
use mlink_proto::endpoint::EndpointProtocolBuilder;
use mlink_proto::framer::{PacketUnwrapper, PacketWrapper, MAX_PAYLOAD};
use mlink_proto::transport::testing::byte_pipe_pair;
use mlink_proto::transport::{PacketRecv, PacketSink, PacketSource, TransferStatus};

/// Endpoint id for the made-up "motor move" RPC this demo sends.
const MOVE_ENDPOINT: u16 = 0x01;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let (host, device) = byte_pipe_pair(4096);
    let (host_reader, host_writer) = host.into_split();
    let (device_reader, device_writer) = device.into_split();

    // Stand-in for the embedded motor controller: acknowledges every move
    // request with the number of steps actually taken, echoing the request
    // verbatim since this demo doesn't model real motor state.
    tokio::spawn(async move {
        let mut source = PacketUnwrapper::new(device_reader);
        let mut sink = PacketWrapper::new(device_writer);
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            match source.recv(&mut buf).await {
                PacketRecv::Ok(len) => {
                    let reply = &buf[..len];
                    if sink.send(reply).await != TransferStatus::Ok {
                        return;
                    }
                }
                PacketRecv::BadFrame => continue,
                PacketRecv::Closed | PacketRecv::Error => return,
            }
        }
    });

    let (endpoint, _join) = EndpointProtocolBuilder::new()
        .spawn(PacketWrapper::new(host_writer), PacketUnwrapper::new(host_reader));

    for steps in [10u8, 25, 100] {
        let invocation = endpoint.invoke(MOVE_ENDPOINT, Bytes::from(vec![steps])).await.unwrap();
        let reply = invocation.await.unwrap();
        println!("moved {steps} steps, device replied {reply:?}");
    }
}
