use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use common::{packet_loss, AsyncICMPSocket, ICMPSocket, Statistics};
use tokio::{signal, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::{args, packet};

/// Counters shared between the transmit and receive loops. The identifier is
/// fixed for the whole session; the counts are written from different tasks
/// and read by the stop-condition checks and the final report.
struct Counters {
    identifier: u16,
    transmitted: AtomicU64,
    received: AtomicU64,
}

pub struct IcmpClient {
    /// Shared by both loops; writes and reads are independent directions of
    /// the one raw socket
    socket: Arc<AsyncICMPSocket>,
    /// Session options
    opts: args::Opts,
    /// Resolved destination
    dst_addr: Ipv4Addr,
    counters: Arc<Counters>,
    /// Rtt samples, mutated only by the receive loop
    stats: Arc<Mutex<Statistics>>,
    /// Single-shot termination signal, checked by every loop iteration
    shutdown: CancellationToken,
}

impl IcmpClient {
    pub fn new(opts: args::Opts, dst_addr: Ipv4Addr) -> Result<IcmpClient> {
        let socket = ICMPSocket::new(opts.iface.as_deref())?;
        if opts.debug {
            socket.set_debug()?;
        }

        Ok(IcmpClient {
            socket: Arc::new(AsyncICMPSocket::new(socket)?),
            opts,
            dst_addr,
            counters: Arc::new(Counters {
                identifier: (std::process::id() & 0xffff) as u16,
                transmitted: AtomicU64::new(0),
                received: AtomicU64::new(0),
            }),
            stats: Arc::new(Mutex::new(Statistics::new())),
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        println!(
            "PING {} ({}) {} bytes of data.",
            self.opts.destination, self.dst_addr, self.opts.size
        );

        let interval = Duration::from_secs(self.opts.interval);
        let transmit = tokio::spawn(transmit_loop(
            self.socket.clone(),
            self.dst_addr,
            self.counters.clone(),
            self.opts.size,
            interval,
            self.opts.count,
            self.shutdown.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            self.socket.clone(),
            self.dst_addr,
            self.counters.clone(),
            self.stats.clone(),
            interval * 2,
            self.opts.count,
            self.opts.oneshot,
            self.shutdown.clone(),
        ));
        if let Some(secs) = self.opts.timeout {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        shutdown.cancel()
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                // Print on a new line, because some terminals will print
                // "^C" which makes the text look ugly
                println!("\nCtrl-C received, exiting");
                self.shutdown.cancel();
            }
            _ = self.shutdown.cancelled() => {}
        }
        // Let both loops observe the cancellation so the report sees final
        // counts
        let _ = tokio::join!(transmit, receive);

        self.report().await;
        Ok(())
    }

    async fn report(&self) {
        let transmitted = self.counters.transmitted.load(Ordering::Relaxed);
        let received = self.counters.received.load(Ordering::Relaxed);
        println!();
        println!("--- {} ping statistics ---", self.opts.destination);
        println!(
            "{} packets transmitted, {} packets received, {:.2}% packet loss",
            transmitted,
            received,
            packet_loss(transmitted, received)
        );
        println!("{}", self.stats.lock().await.summary(received));
    }
}

/// Send one Echo Request per interval until cancelled, the receive side has
/// collected enough replies, or a send fails. A send failure ends only this
/// loop; the receive side and the overall timeout still terminate the
/// session.
async fn transmit_loop(
    socket: Arc<AsyncICMPSocket>,
    dst_addr: Ipv4Addr,
    counters: Arc<Counters>,
    size: usize,
    interval: Duration,
    count: Option<u64>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let request = packet::EchoRequest {
            identifier: counters.identifier,
            // wraps at 65536 by construction
            sequence: counters.transmitted.load(Ordering::Relaxed) as u16,
        };
        let now_ns =
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos() as i64;
        let wire = request.encode(size, now_ns);
        if let Err(e) = socket.send_to(&wire, dst_addr).await {
            eprintln!("send error: {}", e);
            break;
        }
        counters.transmitted.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
        if let Some(count) = count {
            if counters.received.load(Ordering::Relaxed) >= count {
                break;
            }
        }
    }
    Ok(())
}

/// Read datagrams until a stop condition is met. Each read is bounded by
/// `deadline` (twice the send interval); a missed deadline or a failed read
/// is reported and retried. Datagrams from other sessions sharing the raw
/// socket are discarded without touching the counters.
async fn receive_loop(
    socket: Arc<AsyncICMPSocket>,
    dst_addr: Ipv4Addr,
    counters: Arc<Counters>,
    stats: Arc<Mutex<Statistics>>,
    deadline: Duration,
    count: Option<u64>,
    oneshot: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(deadline, socket.read(&mut buf)) => {
                read
            }
        };
        let len = match read {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                eprintln!("read error: {}", e);
                continue;
            }
            Err(_deadline_exceeded) => {
                eprintln!("Request timeout");
                continue;
            }
        };

        let reply = match match_reply(&buf[..len], counters.identifier) {
            Some(reply) => reply,
            None => continue,
        };
        let received = counters.received.fetch_add(1, Ordering::Relaxed) + 1;

        let size = len - packet::IP_HEADER_SIZE;
        match reply.timestamp_ns {
            Some(sent_ns) => {
                let now_ns = SystemTime::now()
                    .duration_since(UNIX_EPOCH)?
                    .as_nanos() as i64;
                let rtt = (now_ns - sent_ns) as f64 / 1e6;
                println!(
                    "{} bytes from {}: icmp_seq={} ttl={} time={:.3}ms",
                    size, dst_addr, reply.sequence, reply.ttl, rtt
                );
                stats.lock().await.record(rtt);
            }
            None => println!(
                "{} bytes from {}: icmp_seq={} ttl={}",
                size, dst_addr, reply.sequence, reply.ttl
            ),
        }

        if should_stop(count, oneshot, received) {
            shutdown.cancel();
            break;
        }
    }
    Ok(())
}

/// Parse a datagram and keep it only when it belongs to this session.
fn match_reply(buf: &[u8], identifier: u16) -> Option<packet::EchoReply> {
    packet::parse_reply(buf).filter(|reply| reply.identifier == identifier)
}

/// Stop once the requested number of replies is in, or after the first one
/// in oneshot mode.
fn should_stop(count: Option<u64>, oneshot: bool, received: u64) -> bool {
    matches!(count, Some(count) if received >= count)
        || (oneshot && received >= 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::EchoRequest;

    fn reply_datagram(identifier: u16, sequence: u16) -> Vec<u8> {
        let request = EchoRequest {
            identifier,
            sequence,
        };
        let mut datagram = vec![0u8; packet::IP_HEADER_SIZE];
        datagram[8] = 64;
        datagram.extend_from_slice(&request.encode(56, 0));
        datagram
    }

    #[test]
    fn foreign_identifier_is_discarded() {
        let datagram = reply_datagram(0x4242, 1);
        assert!(match_reply(&datagram, 0x1111).is_none());
    }

    #[test]
    fn matching_identifier_is_kept() {
        let datagram = reply_datagram(0x4242, 3);
        let reply = match_reply(&datagram, 0x4242).unwrap();
        assert_eq!(reply.sequence, 3);
    }

    #[test]
    fn stop_after_count() {
        assert!(!should_stop(Some(3), false, 2));
        assert!(should_stop(Some(3), false, 3));
        assert!(should_stop(Some(3), false, 4));
    }

    #[test]
    fn stop_after_first_reply_in_oneshot() {
        assert!(!should_stop(None, true, 0));
        assert!(should_stop(None, true, 1));
    }

    #[test]
    fn no_stop_without_conditions() {
        assert!(!should_stop(None, false, 1_000));
    }
}
