//! TCP session with the ODMR board's photon counter.
//!
//! # Session State Machine
//!
//! ```text
//! Disconnected --connect--> Connected --start--> Armed --poll--> Connected
//!       ^                        |                  |
//!       +-------- any I/O or decode failure --------+
//! ```
//!
//! After a start the board needs the full integration window, plus margin,
//! before a poll returns meaningful data. [`PhotonCounter::measure`] runs the
//! whole start, wait, poll cycle and reconnects first if an earlier failure
//! dropped the session.
//!
//! Any failed exchange drops the socket. A reply that arrives after a
//! timeout would otherwise be read as the answer to the next request.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use prost::Message;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::messages::{poll_message, AcquisitionRequest, AcquisitionResult, OdmrMsg};

/// Default ODMR board address.
pub const DEFAULT_ODMR_ADDR: &str = "192.168.0.2:9100";

/// Receive buffer size; replies are well below this.
const RX_BUFFER_SIZE: usize = 8192;

/// Errors raised by the acquisition client.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// TCP connection could not be established or was closed by the board.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No reply within the configured timeout.
    #[error("Timeout waiting for reply")]
    Timeout,

    /// Reply could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not allowed in the current session state.
    #[error("Invalid state: expected {expected:?}, session is {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: SessionState,
        /// State the session was in
        actual: SessionState,
    },

    /// Low-level socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for acquisition operations.
pub type OdmrResult<T> = Result<T, AcquisitionError>;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    /// No socket
    Disconnected,
    /// Socket open, no acquisition running
    Connected,
    /// Acquisition started, waiting to be polled
    Armed,
}

/// Timing parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientSettings {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Read/write timeout for the start exchange
    pub request_timeout: Duration,
    /// Read/write timeout for the poll exchange
    pub poll_timeout: Duration,
    /// Delay between sending a poll and reading its reply
    pub poll_delay: Duration,
    /// Wait after start, as a multiple of the integration time
    pub settle_multiplier: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(4),
            request_timeout: Duration::from_secs(4),
            poll_timeout: Duration::from_secs(1),
            poll_delay: Duration::from_millis(100),
            settle_multiplier: 1.5,
        }
    }
}

impl ClientSettings {
    /// Time to wait after a start before polling.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn settle_time(&self, integration: Duration) -> Duration {
        let secs = integration.as_secs_f64() * self.settle_multiplier.max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Interface for per-point photon counting
///
/// Abstracts the counting instrument so scan orchestration can be tested
/// with a scripted counter.
pub trait PhotonCounter {
    /// Acquire one count for the current mirror position.
    fn measure(
        &mut self,
        request: &AcquisitionRequest,
        integration: Duration,
    ) -> OdmrResult<AcquisitionResult>;

    /// Release the underlying session.
    fn close(&mut self);
}

/// One TCP session with the ODMR board.
///
/// # Example
///
/// ```no_run
/// use hardware::odmr::{AcquisitionClient, ClientSettings, PhotonCounter, RequestSettings};
/// use std::time::Duration;
///
/// let mut client = AcquisitionClient::connect("192.168.0.2:9100", ClientSettings::default())?;
/// let integration = Duration::from_millis(200);
/// let request = RequestSettings::default().request_for(integration);
/// let result = client.measure(&request, integration)?;
/// println!("photons: {} (valid={})", result.photon_count, result.valid);
/// # Ok::<(), hardware::odmr::AcquisitionError>(())
/// ```
pub struct AcquisitionClient {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    state: SessionState,
    settings: ClientSettings,
}

impl AcquisitionClient {
    /// Connect to the board at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Connection`] if the address does not
    /// resolve or the connection is refused or times out.
    pub fn connect<A: ToSocketAddrs>(addr: A, settings: ClientSettings) -> OdmrResult<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| AcquisitionError::Connection(format!("Failed to resolve address: {e}")))?
            .next()
            .ok_or_else(|| AcquisitionError::Connection("Address resolved to nothing".into()))?;

        let mut client = Self {
            addr,
            stream: None,
            state: SessionState::Disconnected,
            settings,
        };
        client.reconnect()?;
        Ok(client)
    }

    /// Re-establish the session after a failure.
    pub fn reconnect(&mut self) -> OdmrResult<()> {
        self.disconnect();

        let stream = TcpStream::connect_timeout(&self.addr, self.settings.connect_timeout)
            .map_err(|e| AcquisitionError::Connection(format!("{}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;

        info!("Connected to ODMR board at {}", self.addr);
        self.stream = Some(stream);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Close the socket. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Disconnected from ODMR board at {}", self.addr);
        }
        self.state = SessionState::Disconnected;
    }

    /// Current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Board address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Timing parameters.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Send a start request and wait for the board's echo.
    ///
    /// Allowed from `Connected`, or from `Armed` to re-arm.
    pub fn start_acquisition(&mut self, request: &AcquisitionRequest) -> OdmrResult<OdmrMsg> {
        if self.state == SessionState::Disconnected {
            return Err(AcquisitionError::InvalidState {
                expected: SessionState::Connected,
                actual: self.state,
            });
        }

        let timeout = self.settings.request_timeout;
        let echo = self.exchange(&request.to_start_message(), timeout, Duration::ZERO)?;
        self.state = SessionState::Armed;
        Ok(echo)
    }

    /// Poll the counts accumulated since the last start.
    ///
    /// The caller must have waited [`ClientSettings::settle_time`] after the
    /// start; earlier polls return undefined data.
    pub fn poll_result(&mut self) -> OdmrResult<AcquisitionResult> {
        if self.state != SessionState::Armed {
            return Err(AcquisitionError::InvalidState {
                expected: SessionState::Armed,
                actual: self.state,
            });
        }

        let timeout = self.settings.poll_timeout;
        let delay = self.settings.poll_delay;
        let reply = self.exchange(&poll_message(), timeout, delay)?;
        self.state = SessionState::Connected;

        let result = AcquisitionResult::from_reply(&reply);
        if !result.valid {
            warn!("ODMR poll reply carried no photon counts");
        }
        Ok(result)
    }

    /// One request/reply round trip. Drops the session on any failure.
    fn exchange(
        &mut self,
        msg: &OdmrMsg,
        timeout: Duration,
        delay: Duration,
    ) -> OdmrResult<OdmrMsg> {
        let result = self.try_exchange(msg, timeout, delay);
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn try_exchange(
        &mut self,
        msg: &OdmrMsg,
        timeout: Duration,
        delay: Duration,
    ) -> OdmrResult<OdmrMsg> {
        let stream = self.stream.as_mut().ok_or(AcquisitionError::InvalidState {
            expected: SessionState::Connected,
            actual: SessionState::Disconnected,
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let tx = msg.encode_to_vec();
        debug!("ODMR send: rw={} ({} bytes)", msg.rw, tx.len());
        stream.write_all(&tx).map_err(map_io)?;
        stream.flush().map_err(map_io)?;

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut rx = vec![0u8; RX_BUFFER_SIZE];
        let n = stream.read(&mut rx).map_err(map_io)?;
        if n == 0 {
            return Err(AcquisitionError::Connection(
                "Board closed the connection".to_string(),
            ));
        }
        trace!("ODMR recv: {:02x?}", &rx[..n]);

        OdmrMsg::decode(&rx[..n]).map_err(|e| AcquisitionError::Protocol(e.to_string()))
    }
}

impl PhotonCounter for AcquisitionClient {
    fn measure(
        &mut self,
        request: &AcquisitionRequest,
        integration: Duration,
    ) -> OdmrResult<AcquisitionResult> {
        if self.state == SessionState::Disconnected {
            self.reconnect()?;
        }

        self.start_acquisition(request)?;
        std::thread::sleep(self.settings.settle_time(integration));
        self.poll_result()
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

impl Drop for AcquisitionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn map_io(e: std::io::Error) -> AcquisitionError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => AcquisitionError::Timeout,
        _ => AcquisitionError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odmr::messages::RequestSettings;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Instant;

    /// What the fake board does with a poll.
    #[derive(Clone, Copy)]
    enum PollBehavior {
        Count(u64),
        Empty,
        Garbage,
        Hangup,
        /// Hang up on the first session's poll, count on later sessions
        HangupFirst(u64),
    }

    /// Minimal ODMR board: echoes starts, answers polls per `behavior`.
    /// Every received message is logged with its arrival time.
    fn spawn_board(
        behavior: PollBehavior,
        connections: usize,
    ) -> (SocketAddr, Arc<Mutex<Vec<(Instant, OdmrMsg)>>>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();

        let handle = std::thread::spawn(move || {
            for session in 0..connections {
                let (mut sock, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sock.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let msg = OdmrMsg::decode(&buf[..n]).unwrap();
                    log.lock().unwrap().push((Instant::now(), msg.clone()));

                    let reply = if msg.rw {
                        msg.encode_to_vec()
                    } else {
                        match behavior {
                            PollBehavior::HangupFirst(_) if session == 0 => break,
                            PollBehavior::Count(c) | PollBehavior::HangupFirst(c) => {
                                let mut r = msg.clone();
                                r.tx_ch.as_mut().unwrap().photon_cnt_val = vec![c];
                                r.tx_ch.as_mut().unwrap().photon_cnt_len = 1;
                                r.encode_to_vec()
                            }
                            PollBehavior::Empty => {
                                let mut r = msg.clone();
                                r.tx_ch.as_mut().unwrap().photon_cnt_val.clear();
                                r.encode_to_vec()
                            }
                            PollBehavior::Garbage => vec![0xff, 0xff, 0xff, 0xff],
                            PollBehavior::Hangup => break,
                        }
                    };
                    if sock.write_all(&reply).is_err() {
                        break;
                    }
                }
            }
        });

        (addr, received, handle)
    }

    fn fast_settings() -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(2),
            poll_delay: Duration::ZERO,
            settle_multiplier: 1.5,
        }
    }

    fn request() -> AcquisitionRequest {
        RequestSettings::default().request_for(Duration::from_millis(5))
    }

    #[test]
    fn test_start_poll_cycle() {
        let (addr, received, handle) = spawn_board(PollBehavior::Count(4321), 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        assert_eq!(client.state(), SessionState::Connected);

        let echo = client.start_acquisition(&request()).unwrap();
        assert!(echo.rw);
        assert_eq!(client.state(), SessionState::Armed);

        let result = client.poll_result().unwrap();
        assert_eq!(result, AcquisitionResult::counted(4321));
        assert_eq!(client.state(), SessionState::Connected);

        client.close();
        handle.join().unwrap();

        let msgs = received.lock().unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].1.rw);
        assert_eq!(msgs[0].1.tx_ch.as_ref().unwrap().pulse_width_us, 5_000);
        assert!(!msgs[1].1.rw);
    }

    #[test]
    fn test_measure_reuses_session() {
        let (addr, received, handle) = spawn_board(PollBehavior::Count(7), 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        for _ in 0..3 {
            let r = client.measure(&request(), Duration::from_millis(5)).unwrap();
            assert_eq!(r, AcquisitionResult::counted(7));
        }
        client.close();
        handle.join().unwrap();
        assert_eq!(received.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_empty_count_list_is_invalid_not_error() {
        let (addr, _, handle) = spawn_board(PollBehavior::Empty, 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        let r = client.measure(&request(), Duration::from_millis(5)).unwrap();
        assert!(!r.valid);
        assert_eq!(r.photon_count, 0);
        assert_eq!(client.state(), SessionState::Connected);
        client.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_garbage_reply_drops_session() {
        let (addr, _, handle) = spawn_board(PollBehavior::Garbage, 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        let err = client
            .measure(&request(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Protocol(_)));
        assert_eq!(client.state(), SessionState::Disconnected);
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_hangup_then_reconnect() {
        let (addr, _, handle) = spawn_board(PollBehavior::Hangup, 2);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();

        let err = client
            .measure(&request(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Connection(_) | AcquisitionError::Io(_)
        ));
        assert_eq!(client.state(), SessionState::Disconnected);

        // The next measurement opens a fresh session.
        let err = client
            .measure(&request(), Duration::from_millis(5))
            .unwrap_err();
        assert!(!matches!(err, AcquisitionError::InvalidState { .. }));
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_measure_waits_settle_time_before_poll() {
        let (addr, received, handle) = spawn_board(PollBehavior::Count(3), 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        let integration = Duration::from_millis(40);
        let req = RequestSettings::default().request_for(integration);
        let r = client.measure(&req, integration).unwrap();
        assert_eq!(r, AcquisitionResult::counted(3));
        client.close();
        handle.join().unwrap();

        let msgs = received.lock().unwrap();
        assert_eq!(msgs.len(), 2);
        let (started, start) = &msgs[0];
        let (polled, poll) = &msgs[1];
        assert!(start.rw);
        assert!(!poll.rw);
        // 1.5 x 40 ms
        assert!(polled.duration_since(*started) >= Duration::from_millis(60));
    }

    #[test]
    fn test_measure_resumes_after_dropped_session() {
        let (addr, received, handle) = spawn_board(PollBehavior::HangupFirst(42), 2);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();

        assert!(client.measure(&request(), Duration::from_millis(5)).is_err());
        assert_eq!(client.state(), SessionState::Disconnected);

        let r = client.measure(&request(), Duration::from_millis(5)).unwrap();
        assert_eq!(r, AcquisitionResult::counted(42));
        assert_eq!(client.state(), SessionState::Connected);

        client.close();
        handle.join().unwrap();
        // start + poll on each session
        assert_eq!(received.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_poll_requires_armed() {
        let (addr, _, handle) = spawn_board(PollBehavior::Count(1), 1);
        let mut client = AcquisitionClient::connect(addr, fast_settings()).unwrap();
        let err = client.poll_result().unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::InvalidState {
                expected: SessionState::Armed,
                actual: SessionState::Connected
            }
        ));
        client.close();
        let err = client.start_acquisition(&request()).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidState { .. }));
        handle.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = AcquisitionClient::connect(addr, fast_settings()).err().unwrap();
        assert!(matches!(err, AcquisitionError::Connection(_)));
    }

    #[test]
    fn test_settle_time() {
        let settings = ClientSettings::default();
        assert_eq!(
            settings.settle_time(Duration::from_secs(2)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_settle_time_saturates() {
        let settings = ClientSettings::default();
        let huge = Duration::try_from_secs_f64(1.5e19).unwrap();
        assert_eq!(settings.settle_time(huge), Duration::MAX);
    }
}
