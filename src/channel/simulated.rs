//! Simulated enclave speaking the mailbox wire format
//!
//! Stands in for `/dev/ele_mu` on development hosts and in tests. Key material
//! is held in process memory and "signatures" are SHA256-derived byte strings
//! of the right length: this is NOT hardware-secured and NOT real ECDSA.
//!
//! Faults can be queued per opcode to exercise timeouts, I/O failures and
//! error statuses. Late frames answering commands the host already gave up
//! on can be queued ahead of the next reply.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::frame::{Command, Opcode, PayloadReader, PayloadWriter, Response, Status};
use super::transport::{Connector, Transport};
use crate::mechanism::EcCurve;

/// Largest digest the sign/verify services accept
pub const MAX_DIGEST_LEN: usize = 64;

const FIRST_KEY_ID: u32 = 0x0001_0001;

/// Misbehavior applied to the next command with a given opcode
#[derive(Debug, Clone)]
pub enum Fault {
    /// Sleep before answering normally
    Stall(Duration),
    /// Fail the exchange at the transport level
    Io(io::ErrorKind),
    /// Answer with this status and no payload
    Status(Status),
    /// Answer with bytes that do not decode as a frame
    Garble,
}

struct SimKey {
    curve: EcCurve,
    secret: [u8; 32],
}

#[derive(Default)]
struct EnclaveState {
    absent: bool,
    unresponsive: bool,
    latency: Duration,
    keys: HashMap<u32, SimKey>,
    next_key_id: u32,
    faults: VecDeque<(Opcode, Fault)>,
    handled: Vec<Opcode>,
    late: VecDeque<Vec<u8>>,
    connections: usize,
    open_links: usize,
}

/// Shared handle to one simulated enclave; clones see the same state
#[derive(Clone, Default)]
pub struct SimulatedEnclave {
    state: Arc<Mutex<EnclaveState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimulatedEnclave {
    pub fn new() -> Self {
        let enclave = Self::default();
        enclave.state.lock().next_key_id = FIRST_KEY_ID;
        enclave
    }

    /// When false, connecting fails as if the device node were missing
    pub fn set_present(&self, present: bool) {
        self.state.lock().absent = !present;
    }

    /// When false, pings are answered with `Failure`
    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().unresponsive = !responsive;
    }

    /// Delay applied to every exchange
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Queue `fault` for the next command carrying `opcode`
    pub fn inject(&self, opcode: Opcode, fault: Fault) {
        self.state.lock().faults.push_back((opcode, fault));
    }

    /// Queue a frame answering `correlation` in front of the next reply,
    /// as if an abandoned command finished late
    pub fn inject_late_reply(&self, correlation: u32) {
        let response = Response {
            status: Status::Ok,
            session: 0,
            correlation,
            payload: Vec::new(),
        };
        if let Ok(frame) = response.encode() {
            self.state.lock().late.push_back(frame);
        }
    }

    /// Keys currently resident in the enclave
    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Opcodes processed so far, in order
    pub fn handled(&self) -> Vec<Opcode> {
        self.state.lock().handled.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Links connected and not yet dropped
    pub fn open_links(&self) -> usize {
        self.state.lock().open_links
    }

    /// Highest number of exchanges ever observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn process(&self, frame: &[u8]) -> io::Result<Vec<u8>> {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);
        let result = self.answer(frame);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn answer(&self, frame: &[u8]) -> io::Result<Vec<u8>> {
        let command = Command::decode(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let (fault, latency) = {
            let mut state = self.state.lock();
            let queued = state.faults.iter().position(|(op, _)| *op == command.opcode);
            let fault = match queued {
                Some(i) => state.faults.remove(i).map(|(_, fault)| fault),
                None => None,
            };
            (fault, state.latency)
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let response = match fault {
            Some(Fault::Stall(delay)) => {
                thread::sleep(delay);
                self.execute(&command)
            }
            Some(Fault::Io(kind)) => {
                return Err(io::Error::new(kind, "injected transport failure"));
            }
            Some(Fault::Status(status)) => Response::reply(&command, status, Vec::new()),
            Some(Fault::Garble) => return Ok(vec![0xEE; 3]),
            None => self.execute(&command),
        };
        response
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn execute(&self, command: &Command) -> Response {
        let mut state = self.state.lock();
        state.handled.push(command.opcode);
        let outcome = match command.opcode {
            Opcode::Ping if state.unresponsive => Err(Status::Failure),
            Opcode::Ping => Ok(command.payload.clone()),
            Opcode::GetRandom => get_random(&command.payload),
            Opcode::GenerateKeyPair => generate_key_pair(&mut state, &command.payload),
            Opcode::DeleteKey => delete_key(&mut state, &command.payload),
            Opcode::Sign => sign(&state, &command.payload),
            Opcode::Verify => verify(&state, &command.payload),
        };
        match outcome {
            Ok(payload) => Response::reply(command, Status::Ok, payload),
            Err(status) => Response::reply(command, status, Vec::new()),
        }
    }
}

type Outcome = Result<Vec<u8>, Status>;

fn malformed<E>(_: E) -> Status {
    Status::Failure
}

fn get_random(payload: &[u8]) -> Outcome {
    let len = PayloadReader::new(payload).u16().map_err(malformed)? as usize;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    Ok(bytes)
}

fn generate_key_pair(state: &mut EnclaveState, payload: &[u8]) -> Outcome {
    let mut reader = PayloadReader::new(payload);
    let curve = EcCurve::from_wire(reader.u8().map_err(malformed)?).ok_or(Status::Unsupported)?;
    let _usage = reader.u8().map_err(malformed)?;

    let key = SimKey {
        curve,
        secret: rand::random(),
    };
    let mut point = vec![0x04];
    point.extend(expand(&key.secret, b"public", &[], 2 * curve.coordinate_len()));

    let key_id = state.next_key_id;
    state.next_key_id += 1;
    state.keys.insert(key_id, key);

    PayloadWriter::new().u32(key_id).bytes16(&point).map(PayloadWriter::finish).map_err(malformed)
}

fn delete_key(state: &mut EnclaveState, payload: &[u8]) -> Outcome {
    let key_id = PayloadReader::new(payload).u32().map_err(malformed)?;
    state
        .keys
        .remove(&key_id)
        .map(|_| Vec::new())
        .ok_or(Status::InvalidKey)
}

fn signature_for(key: &SimKey, digest: &[u8]) -> Vec<u8> {
    expand(&key.secret, b"signature", digest, key.curve.signature_len())
}

fn sign(state: &EnclaveState, payload: &[u8]) -> Outcome {
    let mut reader = PayloadReader::new(payload);
    let key_id = reader.u32().map_err(malformed)?;
    let digest = reader.bytes16().map_err(malformed)?;
    if digest.is_empty() || digest.len() > MAX_DIGEST_LEN {
        return Err(Status::Failure);
    }
    let key = state.keys.get(&key_id).ok_or(Status::InvalidKey)?;
    Ok(signature_for(key, digest))
}

fn verify(state: &EnclaveState, payload: &[u8]) -> Outcome {
    let mut reader = PayloadReader::new(payload);
    let key_id = reader.u32().map_err(malformed)?;
    let digest = reader.bytes16().map_err(malformed)?;
    let signature = reader.bytes16().map_err(malformed)?;
    let key = state.keys.get(&key_id).ok_or(Status::InvalidKey)?;
    if signature_for(key, digest) == signature {
        Ok(Vec::new())
    } else {
        Err(Status::BadSignature)
    }
}

/// SHA256 counter-mode expansion of `secret || label || data`
fn expand(secret: &[u8], label: &[u8], data: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut h = Sha256::new();
        h.update(secret);
        h.update(label);
        h.update(data);
        h.update(counter.to_le_bytes());
        out.extend_from_slice(&h.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

impl Connector for SimulatedEnclave {
    fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let mut state = self.state.lock();
        if state.absent {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "simulated enclave node absent",
            ));
        }
        state.connections += 1;
        state.open_links += 1;
        Ok(Box::new(SimulatedLink {
            enclave: self.clone(),
            outbox: VecDeque::new(),
        }))
    }

    fn location(&self) -> String {
        "simulated://ele".to_string()
    }
}

struct SimulatedLink {
    enclave: SimulatedEnclave,
    outbox: VecDeque<Vec<u8>>,
}

impl Transport for SimulatedLink {
    fn send(&mut self, request: &[u8]) -> io::Result<()> {
        let reply = self.enclave.process(request)?;
        self.outbox.extend(self.enclave.state.lock().late.drain(..));
        self.outbox.push_back(reply);
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        self.outbox
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no frame pending"))
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.enclave.state.lock().open_links -= 1;
    }
}
