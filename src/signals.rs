//! Signal monitoring: blocks every signal on the calling thread, then parks
//! a dedicated OS thread in `sigwait` so the supervisor's async run loop can
//! react to termination signals without a signal handler touching shared
//! state from a signal-unsafe context. Scope note: §1 lists "signal
//! plumbing" as an external collaborator the core drives but does not
//! implement the mechanics of; this module is that mechanism, kept from the
//! teacher's own `signals.rs` and narrowed to the handful of signals the
//! supervisor actually reacts to.

use crate::Result;

pub use nix::sys::signal::Signal;

use nix::libc::{pthread_sigmask, sigfillset, sigset_t, sigwait};
use nix::sys::signal::SigmaskHow::SIG_BLOCK;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) struct Monitor {
    sigmask: Arc<sigset_t>,
    thread_handler: Option<std::thread::JoinHandle<()>>,
}

impl Monitor {
    pub fn new() -> Self {
        let sigmask: sigset_t = unsafe {
            let mut u = MaybeUninit::<sigset_t>::uninit();
            sigfillset(u.as_mut_ptr());
            u.assume_init()
        };

        Self {
            sigmask: Arc::new(sigmask),
            thread_handler: None,
        }
    }

    /// Blocks every signal on this thread (so no handler races the main
    /// loop), then spawns a thread that calls `sigwait` in a loop, forwarding
    /// each signal it catches onto the returned channel.
    pub fn monitor(&mut self) -> Result<mpsc::UnboundedReceiver<Signal>> {
        let pthread_sigmask_ret =
            unsafe { pthread_sigmask(SIG_BLOCK as i32, &*self.sigmask, ptr::null_mut()) };
        if pthread_sigmask_ret != 0 {
            panic!("pthread_sigmask returned error: {}", pthread_sigmask_ret);
        }

        let sigmask = Arc::clone(&self.sigmask);
        let (sig_sender, sig_receiver) = mpsc::unbounded_channel();

        self.thread_handler = Some(std::thread::spawn(move || loop {
            let mut s: i32 = 0;

            debug!("calling sigwait");
            let sigwait_ret = unsafe { sigwait(&*sigmask, &mut s) };
            if sigwait_ret != 0 {
                panic!("sigwait returned an error: {}", sigwait_ret);
            }
            debug!(signal = s, "received signal from sigwait");

            let Ok(signal) = Signal::try_from(s) else {
                continue;
            };
            if sig_sender.send(signal).is_err() {
                break;
            }
        }));

        Ok(sig_receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_delivers_a_raised_signal() {
        let mut monitor = Monitor::new();
        let mut rx = monitor.monitor().unwrap();

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("channel closed");
        assert_eq!(received, Signal::SIGUSR1);
    }
}
