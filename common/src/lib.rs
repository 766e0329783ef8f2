use std::{
    fmt,
    mem::MaybeUninit,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

// Strongly typed raw ICMP socket. One session shares a single socket between
// its transmit and receive halves, so the async wrapper below only takes
// shared references.
pub struct ICMPSocket(Socket);

impl ICMPSocket {
    pub fn new(bind_interface: Option<&str>) -> Result<ICMPSocket> {
        let socket =
            Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        let socket = match bind_interface {
            Some(bi) => bind_to_device(socket, bi)?,
            None => socket,
        };

        Ok(ICMPSocket(socket))
    }

    /// Turn on SO_DEBUG for the underlying socket. socket2 has no setter for
    /// this option, so go through libc directly.
    pub fn set_debug(&self) -> Result<()> {
        let enable: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_DEBUG,
                &enable as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            return Err(anyhow!(
                "setting SO_DEBUG failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut Socket {
        &mut self.0
    }
    pub fn get_ref(&self) -> &Socket {
        &self.0
    }
}

impl AsRawFd for ICMPSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct AsyncICMPSocket {
    inner: AsyncFd<ICMPSocket>,
}

impl AsyncICMPSocket {
    pub fn new(socket: ICMPSocket) -> Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub async fn send_to(
        &self,
        packet: &[u8],
        addr: Ipv4Addr,
    ) -> Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(addr, 0)));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard
                .try_io(|inner| inner.get_ref().get_ref().send_to(packet, &addr))
            {
                Ok(res) => return Ok(res?),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            // Safety: recv wants an uninitialized buffer, ours is already
            // initialized
            let uninit_slice =
                unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };

            match guard
                .try_io(|inner| inner.get_ref().get_ref().recv(uninit_slice))
            {
                Ok(res) => return Ok(res?),
                Err(_would_block) => continue,
            }
        }
    }
}

pub fn bind_to_device(
    socket: Socket,
    bind_interface: &str,
) -> Result<Socket, std::io::Error> {
    // Socket2 bind_device does not have nice error types, so we have to handle
    // the libc errors. In case, we get an error when binding, map it into a
    // more friendly std::io::Error
    if let Err(err) = socket.bind_device(Some(bind_interface.as_bytes())) {
        return if matches!(err.raw_os_error(), Some(libc::ENODEV)) {
            let error_msg = format!(
                "error binding to device (`{}`): {}",
                bind_interface, err
            );
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        } else {
            let error_msg = format!("unexpected error binding device: {}", err);
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        };
    }

    Ok(socket)
}

/// Round-trip time accumulator. Samples stay in arrival order and the
/// aggregates are computed once, at report time.
pub struct Statistics {
    samples: Vec<f64>,
}

/// Final min/max/avg/stddev block, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "round-trip min/max/avg/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
            self.min, self.max, self.avg, self.stddev
        )
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, rtt_ms: f64) {
        self.samples.push(rtt_ms);
    }

    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    /// Aggregate the recorded samples. `received` is the reply counter, not
    /// the sample count; the two differ when a matched reply carried no
    /// decodable timestamp, and both the average and the population standard
    /// deviation divide by the reply counter.
    pub fn summary(&self, received: u64) -> Summary {
        if self.samples.is_empty() {
            return Summary {
                min: 0.0,
                max: 0.0,
                avg: 0.0,
                stddev: 0.0,
            };
        }

        let mut min = self.samples[0];
        let mut max = self.samples[0];
        let mut sum = 0.0;
        for &t in &self.samples {
            sum += t;
            min = min.min(t);
            max = max.max(t);
        }
        let avg = sum / received as f64;

        let mut variance = 0.0;
        for &t in &self.samples {
            let diff = t - avg;
            variance += diff * diff;
        }
        let stddev = (variance / received as f64).sqrt();

        Summary {
            min,
            max,
            avg,
            stddev,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentage of transmitted packets that never produced a reply. Zero
/// transmissions count as zero loss rather than a division by zero.
pub fn packet_loss(transmitted: u64, received: u64) -> f64 {
    if transmitted == 0 {
        return 0.0;
    }
    (transmitted as f64 - received as f64) * 100.0 / transmitted as f64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn summary_empty() {
        let stats = Statistics::new();
        let summary = stats.summary(0);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.max, 0.0);
        assert_eq!(summary.avg, 0.0);
        assert_eq!(summary.stddev, 0.0);
    }

    #[test]
    fn summary_three_samples() {
        let mut stats = Statistics::new();
        stats.record(10.0);
        stats.record(20.0);
        stats.record(30.0);

        let summary = stats.summary(3);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.avg, 20.0);
        // population stddev: sqrt((100 + 0 + 100) / 3)
        assert!((summary.stddev - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn summary_divides_by_received_not_samples() {
        // A reply without a decodable timestamp bumps the reply counter but
        // records no sample.
        let mut stats = Statistics::new();
        stats.record(10.0);
        stats.record(20.0);

        let summary = stats.summary(3);
        assert_eq!(summary.avg, 10.0);
    }

    #[test]
    fn summary_display() {
        let mut stats = Statistics::new();
        stats.record(1.5);
        let line = stats.summary(1).to_string();
        assert_eq!(
            line,
            "round-trip min/max/avg/stddev = 1.500/1.500/1.500/0.000 ms"
        );
    }

    #[test]
    fn loss_no_packets_lost() {
        assert_eq!(packet_loss(10, 10), 0.0);
    }

    #[test]
    fn loss_all_packets_lost() {
        assert_eq!(packet_loss(10, 0), 100.0);
    }

    #[test]
    fn loss_nothing_transmitted() {
        assert_eq!(packet_loss(0, 0), 0.0);
    }

    #[test]
    fn loss_partial() {
        assert_eq!(packet_loss(4, 3), 25.0);
    }
}
