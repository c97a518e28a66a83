//! Rate-limited socket I/O.
//!
//! The HTTP engine never talks to a socket directly; every read and write is
//! metered against a [`BandwidthScheduler`] so that a servent can keep its
//! Gnutella traffic within the quotas the embedding application configured.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod bucket;

pub use bucket::TokenBucket;

/// Direction of a transfer, from the servent's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Byte quota accounting for a pair of traffic directions.
///
/// `claim` grants up to `want` bytes out of the current quota window; a grant
/// of zero means the quota is exhausted and the caller should wait
/// [`refill_wait`](BandwidthScheduler::refill_wait) before trying again.
/// Unused grants are returned with `give_back` so a short write does not burn
/// quota that never reached the wire.
pub trait BandwidthScheduler: Send + Sync {
    fn claim(&self, dir: Direction, want: usize) -> usize;

    fn give_back(&self, dir: Direction, unused: usize);

    /// Whether the given direction is at quota. Consulted when shaping
    /// response headers.
    fn saturated(&self, dir: Direction) -> bool;

    /// How long until `claim` may grant bytes again.
    fn refill_wait(&self, dir: Direction) -> Duration;
}

/// Pass-through scheduler: every claim is granted in full and the link is
/// never considered saturated.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unmetered;

impl BandwidthScheduler for Unmetered {
    fn claim(&self, _dir: Direction, want: usize) -> usize {
        want
    }

    fn give_back(&self, _dir: Direction, _unused: usize) {}

    fn saturated(&self, _dir: Direction) -> bool {
        false
    }

    fn refill_wait(&self, _dir: Direction) -> Duration {
        Duration::ZERO
    }
}

/// Write as much of `buf` as the outbound quota allows in one attempt.
///
/// Returns the number of bytes actually written, which may be short; the
/// caller keeps the remainder and retries.
pub(crate) async fn limited_write<S>(
    stream: &mut S,
    sched: &dyn BandwidthScheduler,
    buf: &[u8],
) -> io::Result<usize>
where
    S: AsyncWrite + Unpin,
{
    loop {
        let granted = sched.claim(Direction::Outbound, buf.len());
        if granted == 0 {
            let wait = sched.refill_wait(Direction::Outbound);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            continue;
        }
        match stream.write(&buf[..granted]).await {
            Ok(n) => {
                if n < granted {
                    sched.give_back(Direction::Outbound, granted - n);
                }
                return Ok(n);
            }
            Err(e) => {
                sched.give_back(Direction::Outbound, granted);
                return Err(e);
            }
        }
    }
}

/// Read into `buf`, bounded by the inbound quota.
pub(crate) async fn limited_read<S>(
    stream: &mut S,
    sched: &dyn BandwidthScheduler,
    buf: &mut [u8],
) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    loop {
        let granted = sched.claim(Direction::Inbound, buf.len());
        if granted == 0 {
            let wait = sched.refill_wait(Direction::Inbound);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            continue;
        }
        match stream.read(&mut buf[..granted]).await {
            Ok(n) => {
                if n < granted {
                    sched.give_back(Direction::Inbound, granted - n);
                }
                return Ok(n);
            }
            Err(e) => {
                sched.give_back(Direction::Inbound, granted);
                return Err(e);
            }
        }
    }
}
