//! Tap device interface (spec §1 "External interfaces", §6 "Device I/O").
//! The concrete platform driver (a `/dev/net/tun` char device on Linux, a
//! utun socket on macOS, …) is an external collaborator out of scope for
//! this crate; what lives here is the trait boundary `mesh-service` wires a
//! real driver into, plus a `NullTapDevice` double for tests and for running
//! the reactor headless.

use async_trait::async_trait;

/// Default frame MTU a driver should size its read buffer around (spec §3
/// `DEFAULT_MTU`); actual negotiated PMTU is tracked per-node in
/// `model::node::MtuProbeState`, not here.
pub const MAX_FRAME_SIZE: usize = 65536;

/// One raw Ethernet (or, in router mode, raw IP) frame read from or written
/// to the local interface (spec §3 "tap device packet").
#[derive(Debug, Clone)]
pub struct Packet {
    pub priority: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self { priority: 0, data }
    }
}

/// Platform tap/tun device, spec §1: "Out of scope... the concrete tap/tun
/// driver (platform-specific char device or netlink setup)". `mesh-core`
/// only needs something that yields and accepts raw frames.
#[async_trait]
pub trait TapDevice: Send + 'static {
    async fn setup(&mut self) -> std::io::Result<()>;
    async fn close(&mut self) -> std::io::Result<()>;

    /// Read one frame into `buf`, returning the number of bytes written.
    async fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    async fn write_packet(&mut self, data: &[u8]) -> std::io::Result<()>;
}

/// A tap device that never produces a frame and discards writes. Used by
/// the reactor's unit/integration tests, and as a placeholder on platforms
/// where no real driver has been wired up yet.
pub struct NullTapDevice;

#[async_trait]
impl TapDevice for NullTapDevice {
    async fn setup(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn read_packet(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        std::future::pending::<()>().await;
        unreachable!("NullTapDevice never produces a frame")
    }

    async fn write_packet(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}
