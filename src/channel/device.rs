//! Device channel: the single serialized path to the enclave
//!
//! Queue policy: callers are served first-come-first-served by the fair
//! `tokio::sync::Mutex` guarding the link. A caller still waiting after the
//! queue timeout gives up with `DeviceBusy` and leaves the queue. Only the
//! caller holding the link has a command in flight.
//!
//! The blocking transport runs on the channel's own runtime through
//! `spawn_blocking`, so a caller can stop waiting after the command timeout.
//! Frames whose correlation id does not match the command in flight answer
//! commands that were given up on; they are read and dropped until the
//! matching reply arrives.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Mutex;
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time::{self, Instant};

use super::frame::{Command, Opcode, Response};
use super::transport::{Connector, Transport};
use crate::config::ModuleConfig;
use crate::error::{TokenError, TokenResult};

/// Bounds applied to channel waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Per-command reply wait
    pub command: Duration,
    /// Wait for a turn in the queue
    pub queue: Duration,
    /// Reply wait for the liveness probe
    pub probe: Duration,
}

impl ChannelTimeouts {
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            command: config.command_timeout(),
            queue: config.queue_timeout(),
            probe: config.probe_timeout(),
        }
    }
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self::from_config(&ModuleConfig::default())
    }
}

/// A blocking transport call; the transport travels with it and comes back
type Exchange = JoinHandle<(Box<dyn Transport>, io::Result<Vec<u8>>)>;

fn send_and_receive(mut transport: Box<dyn Transport>, frame: Vec<u8>) -> Exchange {
    task::spawn_blocking(move || {
        let result = transport.send(&frame).and_then(|()| transport.receive());
        (transport, result)
    })
}

fn receive_next(mut transport: Box<dyn Transport>) -> Exchange {
    task::spawn_blocking(move || {
        let result = transport.receive();
        (transport, result)
    })
}

fn transport_lost(e: JoinError) -> TokenError {
    TokenError::DeviceError(format!("mailbox transport lost: {}", e))
}

struct Link {
    /// `None` while an exchange owns it
    transport: Option<Box<dyn Transport>>,
    /// Exchange whose caller timed out
    pending: Option<Exchange>,
}

impl Link {
    /// Take the transport back from an abandoned exchange. Whatever frame it
    /// read answers a command nobody waits for anymore.
    async fn settle(&mut self, deadline: Instant, timeout: Duration) -> TokenResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let joined = time::timeout_at(deadline, pending)
            .await
            .map_err(|_| TokenError::DeviceTimeout(timeout))?;
        self.pending = None;

        let (transport, result) = joined.map_err(transport_lost)?;
        match result.map(|bytes| Response::decode(&bytes)) {
            Ok(Ok(stale)) => warn!("Discarding stale enclave reply corr={}", stale.correlation),
            Ok(Err(e)) => warn!("Discarding undecodable stale enclave frame: {}", e),
            Err(e) => debug!("Abandoned exchange ended with {}", e),
        }
        self.transport = Some(transport);
        Ok(())
    }
}

/// Runtime and link that exist while the channel is open
struct Driver {
    runtime: Runtime,
    link: Mutex<Link>,
}

impl Driver {
    fn start(transport: Box<dyn Transport>) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("ele-mailbox")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            link: Mutex::new(Link {
                transport: Some(transport),
                pending: None,
            }),
        })
    }

    /// Drop the transport, waiting at most `bound` for an abandoned exchange
    /// to hand it back
    fn shutdown(self, bound: Duration) {
        let Driver { runtime, link } = self;
        let mut link = link.into_inner();
        if let Some(pending) = link.pending.take() {
            match runtime.block_on(time::timeout(bound, pending)) {
                Ok(Ok((transport, _))) => drop(transport),
                Ok(Err(e)) => warn!("Abandoned mailbox exchange failed: {}", e),
                Err(_) => warn!(
                    "Abandoned mailbox exchange still blocked after {:?}, leaving it behind",
                    bound
                ),
            }
        }
        drop(link);
        runtime.shutdown_background();
    }
}

/// Serialized command channel to the enclave
pub struct DeviceChannel {
    connector: Arc<dyn Connector>,
    timeouts: ChannelTimeouts,
    driver: RwLock<Option<Driver>>,
    open: AtomicBool,
    next_correlation: AtomicU32,
}

impl DeviceChannel {
    pub fn new(connector: Arc<dyn Connector>, timeouts: ChannelTimeouts) -> Self {
        Self {
            connector,
            timeouts,
            driver: RwLock::new(None),
            open: AtomicBool::new(false),
            next_correlation: AtomicU32::new(1),
        }
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    pub fn location(&self) -> String {
        self.connector.location()
    }

    /// Never waits on a command in flight
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Acquire the enclave link. Opening an open channel is a no-op.
    pub fn open(&self) -> TokenResult<()> {
        let mut driver = self.driver.write();
        if driver.is_some() {
            return Ok(());
        }
        let transport = self
            .connector
            .connect()
            .map_err(|e| self.unavailable(e.to_string()))?;
        let started = Driver::start(transport).map_err(|e| self.unavailable(e.to_string()))?;
        *driver = Some(started);
        self.open.store(true, Ordering::SeqCst);
        info!("Enclave channel open on {}", self.connector.location());
        Ok(())
    }

    /// Release the link. Waits for the command in flight, if any, to finish
    /// or time out. Closing a closed channel is a no-op.
    pub fn close(&self) {
        let taken = self.driver.write().take();
        self.open.store(false, Ordering::SeqCst);
        if let Some(driver) = taken {
            driver.shutdown(self.timeouts.command);
            info!("Enclave channel on {} closed", self.connector.location());
        }
    }

    /// Send `command` and wait for its reply within the command timeout
    pub fn submit(&self, command: Command) -> TokenResult<Response> {
        self.submit_within(command, self.timeouts.command)
    }

    /// Liveness check: a ping whose nonce must come back unchanged
    pub fn probe(&self) -> TokenResult<()> {
        let nonce: [u8; 8] = rand::random();
        let response = self
            .submit_within(Command::new(Opcode::Ping, 0, nonce.to_vec()), self.timeouts.probe)
            .map_err(|e| TokenError::DeviceNotResponsive(e.to_string()))?;
        if !response.is_ok() {
            return Err(TokenError::DeviceNotResponsive(format!(
                "ping answered with {:?}",
                response.status
            )));
        }
        if response.payload != nonce {
            return Err(TokenError::DeviceNotResponsive(
                "ping nonce was not echoed".to_string(),
            ));
        }
        Ok(())
    }

    fn submit_within(&self, command: Command, timeout: Duration) -> TokenResult<Response> {
        let driver = self.driver.read();
        let driver = driver
            .as_ref()
            .ok_or_else(|| self.unavailable("channel is closed".to_string()))?;
        driver
            .runtime
            .block_on(self.exchange(&driver.link, command, timeout))
    }

    async fn exchange(
        &self,
        link: &Mutex<Link>,
        mut command: Command,
        timeout: Duration,
    ) -> TokenResult<Response> {
        let queue = self.timeouts.queue;
        let mut link = time::timeout(queue, link.lock())
            .await
            .map_err(|_| TokenError::DeviceBusy(queue))?;

        let deadline = Instant::now() + timeout;
        link.settle(deadline, timeout).await?;
        let transport = link
            .transport
            .take()
            .ok_or_else(|| TokenError::DeviceError("mailbox transport lost".to_string()))?;

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        command.correlation = correlation;
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(e) => {
                link.transport = Some(transport);
                return Err(e.into());
            }
        };
        debug!(
            "-> {:?} session={} corr={} payload={}",
            command.opcode,
            command.session,
            correlation,
            hex::encode(&command.payload)
        );

        let mut call = send_and_receive(transport, frame);
        loop {
            let (transport, result) = match time::timeout_at(deadline, &mut call).await {
                Ok(joined) => joined.map_err(transport_lost)?,
                Err(_) => {
                    warn!(
                        "{:?} corr={} timed out after {:?}",
                        command.opcode, correlation, timeout
                    );
                    link.pending = Some(call);
                    return Err(TokenError::DeviceTimeout(timeout));
                }
            };

            let decoded = result
                .map_err(|e| TokenError::DeviceError(e.to_string()))
                .and_then(|bytes| Response::decode(&bytes).map_err(TokenError::from));
            match decoded {
                Ok(stale) if stale.correlation != correlation => {
                    warn!(
                        "Discarding stale enclave reply corr={} while waiting for corr={}",
                        stale.correlation, correlation
                    );
                    call = receive_next(transport);
                }
                outcome => {
                    link.transport = Some(transport);
                    let response = outcome?;
                    debug!(
                        "<- {:?} corr={} payload={}",
                        response.status,
                        correlation,
                        hex::encode(&response.payload)
                    );
                    return Ok(response);
                }
            }
        }
    }

    fn unavailable(&self, reason: String) -> TokenError {
        TokenError::DeviceUnavailable {
            path: self.connector.location(),
            reason,
        }
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        // never block the dropping thread on a stuck transport
        if let Some(driver) = self.driver.get_mut().take() {
            driver.runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame::Status;
    use crate::channel::simulated::{Fault, SimulatedEnclave};
    use std::thread;
    use std::time::Instant;

    fn timeouts(command_ms: u64, queue_ms: u64) -> ChannelTimeouts {
        ChannelTimeouts {
            command: Duration::from_millis(command_ms),
            queue: Duration::from_millis(queue_ms),
            probe: Duration::from_millis(command_ms),
        }
    }

    fn channel(enclave: &SimulatedEnclave, t: ChannelTimeouts) -> DeviceChannel {
        DeviceChannel::new(Arc::new(enclave.clone()), t)
    }

    fn ping(payload: &[u8]) -> Command {
        Command::new(Opcode::Ping, 1, payload.to_vec())
    }

    #[test]
    fn test_open_close_idempotent() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, ChannelTimeouts::default());

        ch.open().unwrap();
        ch.open().unwrap();
        assert!(ch.is_open());
        assert_eq!(enclave.connections(), 1);

        ch.close();
        ch.close();
        assert!(!ch.is_open());
        assert_eq!(enclave.open_links(), 0);
    }

    #[test]
    fn test_open_missing_device() {
        let enclave = SimulatedEnclave::new();
        enclave.set_present(false);
        let ch = channel(&enclave, ChannelTimeouts::default());

        assert!(matches!(ch.open(), Err(TokenError::DeviceUnavailable { .. })));
        assert!(!ch.is_open());
    }

    #[test]
    fn test_submit_on_closed_channel() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, ChannelTimeouts::default());
        assert!(matches!(
            ch.submit(ping(b"x")),
            Err(TokenError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn test_submit_roundtrip_and_probe() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, ChannelTimeouts::default());
        ch.open().unwrap();

        let response = ch.submit(ping(b"hello")).unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.payload, b"hello");
        ch.probe().unwrap();
        ch.close();
    }

    #[test]
    fn test_probe_unresponsive() {
        let enclave = SimulatedEnclave::new();
        enclave.set_responsive(false);
        let ch = channel(&enclave, ChannelTimeouts::default());
        ch.open().unwrap();

        assert!(matches!(ch.probe(), Err(TokenError::DeviceNotResponsive(_))));
        ch.close();
    }

    #[test]
    fn test_timeout_then_stale_reply_discarded() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, timeouts(50, 2_000));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(200)));
        assert!(matches!(
            ch.submit(ping(b"late")),
            Err(TokenError::DeviceTimeout(_))
        ));

        // The late reply to "late" is queued ahead of ours and must be skipped.
        thread::sleep(Duration::from_millis(250));
        let response = ch.submit(ping(b"fresh")).unwrap();
        assert_eq!(response.payload, b"fresh");
        ch.close();
    }

    #[test]
    fn test_transport_error_surfaces() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, ChannelTimeouts::default());
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Io(io::ErrorKind::BrokenPipe));
        assert!(matches!(
            ch.submit(ping(b"x")),
            Err(TokenError::DeviceError(_))
        ));
        // the channel keeps serving afterwards
        assert!(ch.submit(ping(b"y")).is_ok());
        ch.close();
    }

    #[test]
    fn test_busy_when_queue_wait_expires() {
        let enclave = SimulatedEnclave::new();
        let ch = Arc::new(channel(&enclave, timeouts(2_000, 100)));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(400)));
        let holder = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.submit(ping(b"slow")))
        };
        thread::sleep(Duration::from_millis(50));

        assert!(matches!(
            ch.submit(ping(b"impatient")),
            Err(TokenError::DeviceBusy(_))
        ));
        assert_eq!(holder.join().unwrap().unwrap().payload, b"slow");

        // the caller that gave up does not wedge the queue
        assert!(ch.submit(ping(b"after")).is_ok());
        ch.close();
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let enclave = SimulatedEnclave::new();
        enclave.set_latency(Duration::from_millis(5));
        let ch = Arc::new(channel(&enclave, ChannelTimeouts::default()));
        ch.open().unwrap();

        let workers: Vec<_> = (0..8u8)
            .map(|i| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || ch.submit(ping(&[i])).unwrap().payload)
            })
            .collect();
        for (i, worker) in workers.into_iter().enumerate() {
            assert_eq!(worker.join().unwrap(), vec![i as u8]);
        }
        assert_eq!(enclave.max_in_flight(), 1);
        ch.close();
    }

    #[test]
    fn test_close_waits_for_in_flight_command() {
        let enclave = SimulatedEnclave::new();
        let ch = Arc::new(channel(&enclave, timeouts(2_000, 2_000)));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(150)));
        let holder = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.submit(ping(b"in-flight")))
        };
        thread::sleep(Duration::from_millis(30));
        ch.close();

        assert!(holder.join().unwrap().is_ok());
        assert!(!ch.is_open());
    }

    #[test]
    fn test_late_frames_ahead_of_reply_are_discarded() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, ChannelTimeouts::default());
        ch.open().unwrap();

        enclave.inject_late_reply(999);
        assert_eq!(ch.submit(ping(b"one")).unwrap().payload, b"one");

        enclave.inject_late_reply(1000);
        enclave.inject_late_reply(1001);
        assert_eq!(ch.submit(ping(b"two")).unwrap().payload, b"two");
        assert_eq!(ch.submit(ping(b"three")).unwrap().payload, b"three");
        ch.close();
    }

    #[test]
    fn test_stale_reply_read_by_next_caller() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, timeouts(100, 2_000));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(150)));
        assert!(matches!(
            ch.submit(ping(b"late")),
            Err(TokenError::DeviceTimeout(_))
        ));
        // no pause: the next caller waits out the abandoned exchange itself
        assert_eq!(ch.submit(ping(b"next")).unwrap().payload, b"next");
        assert_eq!(ch.submit(ping(b"after")).unwrap().payload, b"after");
        ch.close();
    }

    #[test]
    fn test_is_open_does_not_wait_for_in_flight_command() {
        let enclave = SimulatedEnclave::new();
        let ch = Arc::new(channel(&enclave, timeouts(2_000, 2_000)));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(600)));
        let holder = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.submit(ping(b"stalled")))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(ch.is_open());
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(holder.join().unwrap().is_ok());
        ch.close();
    }

    #[test]
    fn test_close_after_timeout_releases_transport() {
        let enclave = SimulatedEnclave::new();
        let ch = channel(&enclave, timeouts(150, 2_000));
        ch.open().unwrap();

        enclave.inject(Opcode::Ping, Fault::Stall(Duration::from_millis(250)));
        assert!(matches!(
            ch.submit(ping(b"abandoned")),
            Err(TokenError::DeviceTimeout(_))
        ));
        assert_eq!(enclave.open_links(), 1);

        let started = Instant::now();
        ch.close();
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(enclave.open_links(), 0);
        assert!(!ch.is_open());
    }
}
