//! Bidirectional session pump with a shared inactivity timer.
//!
//! Once a tunnel is up, two copy tasks shuttle bytes between the local
//! stream and the tunnel. A single [`IdleTimer`] governs both: every
//! copied chunk records activity, and when one direction finishes the
//! timer is rearmed with that direction's half-closed budget.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::READ_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::policy::Policy;

/// Cancels a token once no activity has been recorded for the current
/// timeout window.
#[derive(Clone)]
pub struct IdleTimer {
    state: Arc<TimerState>,
}

struct TimerState {
    // (last activity, current window)
    window: Mutex<(Instant, Duration)>,
    rearmed: Notify,
}

impl IdleTimer {
    /// Starts the watchdog task; `token` is cancelled after `timeout`
    /// of inactivity.
    pub fn start(token: CancellationToken, timeout: Duration) -> Self {
        let timer = Self {
            state: Arc::new(TimerState {
                window: Mutex::new((Instant::now(), timeout)),
                rearmed: Notify::new(),
            }),
        };

        let state = timer.state.clone();
        tokio::spawn(async move {
            loop {
                let (last, timeout) = *state.window.lock().unwrap();
                let deadline = last + timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let (last, timeout) = *state.window.lock().unwrap();
                        if Instant::now() >= last + timeout {
                            token.cancel();
                            return;
                        }
                    }
                    _ = state.rearmed.notified() => {}
                    _ = token.cancelled() => return,
                }
            }
        });

        timer
    }

    /// Records activity, pushing the deadline out.
    pub fn update(&self) {
        self.state.window.lock().unwrap().0 = Instant::now();
    }

    /// Replaces the timeout window and restarts it from now.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.state.window.lock().unwrap() = (Instant::now(), timeout);
        // The new window may be shorter than the one being slept on.
        self.state.rearmed.notify_one();
    }
}

/// Copies `reader` to `writer` until EOF, recording activity per chunk.
///
/// Cancellation surfaces as a timed-out IO error so the session is
/// reported as ended rather than cleanly closed.
async fn copy_with_activity(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    timer: &IdleTimer,
    token: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "session cancelled",
                )));
            }
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        timer.update();
        total += n as u64;
    }
}

/// Pumps bytes between the local stream and the tunnel until both
/// directions finish, the idle timer fires, or the caller cancels.
///
/// The tunnel is consumed and dropped (closed) on every exit path. The
/// local writer is shut down once the downlink completes cleanly.
pub async fn run_relay<T, R, W>(
    tunnel: T,
    local_reader: R,
    local_writer: W,
    policy: Policy,
    parent: &CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let token = parent.child_token();
    let timer = IdleTimer::start(token.clone(), policy.idle_timeout);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let uplink = {
        let timer = timer.clone();
        let token = token.clone();
        let mut local_reader = local_reader;
        tokio::spawn(async move {
            let res = copy_with_activity(&mut local_reader, &mut tunnel_write, &timer, &token).await;
            timer.set_timeout(policy.downlink_only_timeout);
            res
        })
    };

    let downlink = {
        let timer = timer.clone();
        let token = token.clone();
        let mut local_writer = local_writer;
        tokio::spawn(async move {
            let res = copy_with_activity(&mut tunnel_read, &mut local_writer, &timer, &token).await;
            timer.set_timeout(policy.uplink_only_timeout);
            if res.is_ok() {
                local_writer.shutdown().await.ok();
            }
            res
        })
    };

    let (up, down) = tokio::join!(uplink, downlink);
    token.cancel();

    for res in [up, down] {
        match res {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(Error::ConnectionEnds(Box::new(err))),
            Err(err) => {
                return Err(Error::ConnectionEnds(Box::new(Error::Io(io::Error::other(
                    format!("copy task panicked: {}", err),
                )))))
            }
        }
    }

    Ok(())
}
