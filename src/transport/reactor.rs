//! Drive a [`Context`] from a tokio runtime
//!
//! The context stays single-threaded: the future returned by [`drive`] is
//! not `Send` and is meant for a current-thread runtime or a `LocalSet`.

use crate::connection::{Context, Events};
use crate::error::{Error, Result};
use std::future::{poll_fn, Future};
use std::io;
use std::os::unix::io::RawFd;
use std::task::Poll;
use std::time::Duration;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::io::{Interest, Ready};
use tracing::trace;

/// Tick used when the context asks for no timeout at all.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Service `ctx` until `done` returns true.
///
/// Readiness comes from the tokio reactor instead of `poll(2)`; timeouts
/// and the happy-eyeballs delay are honored through `tokio::time`. Every
/// descriptor the context reports is watched, so a later connect candidate
/// can win the race.
pub async fn drive(ctx: &mut Context, mut done: impl FnMut(&Context) -> bool) -> Result<()> {
    let mut registered: Vec<AsyncFd<RawFd>> = Vec::new();
    loop {
        if done(ctx) {
            return Ok(());
        }
        let (fds, timeout_ms) = ctx.get_fds();
        if fds.is_empty() {
            return Err(Error::NotConnected);
        }
        // candidate sockets come and go, and a new one may reuse a number
        if !ctx.is_connected() {
            registered.clear();
        }
        sync_registrations(&mut registered, &fds)?;

        let wanted = ctx.which_events();
        let tick = u64::try_from(timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(IDLE_TICK);
        let established = ctx.is_connected();

        tokio::select! {
            ready = next_ready(&registered, wanted) => {
                let (fd, revents, mut guard) = ready?;
                ctx.service_fd(fd, revents)?;
                // keep readiness when servicing promoted a candidate: the
                // socket is writable and the first request is still queued
                let drained = if established {
                    ctx.fd() == Some(fd) && ctx.which_events().intersects(revents)
                } else {
                    !ctx.is_connected() && ctx.get_fds().0.contains(&fd)
                };
                if drained {
                    guard.clear_ready();
                }
            }
            _ = tokio::time::sleep(tick) => {
                ctx.service_fd(-1, Events::empty())?;
            }
        }
    }
}

/// Drop registrations for descriptors no longer reported and add new ones.
fn sync_registrations(registered: &mut Vec<AsyncFd<RawFd>>, fds: &[RawFd]) -> io::Result<()> {
    registered.retain(|afd| fds.contains(afd.get_ref()));
    for &fd in fds {
        if !registered.iter().any(|afd| *afd.get_ref() == fd) {
            registered.push(AsyncFd::with_interest(
                fd,
                Interest::READABLE | Interest::WRITABLE,
            )?);
            trace!(fd, "registered with the reactor");
        }
    }
    Ok(())
}

/// Wait until any registered descriptor is ready for one of `wanted`.
fn next_ready(
    registered: &[AsyncFd<RawFd>],
    wanted: Events,
) -> impl Future<Output = io::Result<(RawFd, Events, AsyncFdReadyGuard<'_, RawFd>)>> {
    poll_fn(move |cx| {
        for afd in registered {
            if wanted.contains(Events::READ) {
                if let Poll::Ready(ready) = afd.poll_read_ready(cx) {
                    return Poll::Ready(ready.map(|guard| {
                        let revents = revents(guard.ready(), Events::READ);
                        (*afd.get_ref(), revents, guard)
                    }));
                }
            }
            if wanted.contains(Events::WRITE) {
                if let Poll::Ready(ready) = afd.poll_write_ready(cx) {
                    return Poll::Ready(ready.map(|guard| {
                        let revents = revents(guard.ready(), Events::WRITE);
                        (*afd.get_ref(), revents, guard)
                    }));
                }
            }
        }
        Poll::Pending
    })
}

/// Translate tokio readiness for one direction into poll(2) style events.
fn revents(ready: Ready, direction: Events) -> Events {
    let mut ev = direction;
    let closed = if direction.contains(Events::READ) {
        ready.is_read_closed()
    } else {
        ready.is_write_closed()
    };
    if closed {
        ev |= Events::HANGUP;
    }
    if ready.is_error() {
        ev |= Events::ERROR;
    }
    ev
}
