//! QMUX transport: device ownership, reader thread, client attach/detach.
//!
//! Exactly one transport exists per process. It owns the QMI character
//! device and a reader thread that demultiplexes inbound frames: solicited
//! responses are handed to the requester blocked in [`ServiceClient::request`]
//! through a bounded channel, unsolicited indications are dispatched to the
//! callback registered when the service attached.
//!
//! Attach/detach maps onto QMI CTL client-id allocation and release. The
//! transport must outlive every attached client; shutting it down with
//! clients still attached is a programming error in the caller, not a
//! runtime condition this layer recovers from.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::wire::{decode_frame, encode_request, Frame, FrameKind, Tlvs, TlvWriter};
use crate::{QmiError, ServiceType};

/// Fixed path of the modem's QMI device node.
pub const QMI_DEVICE_PATH: &str = "/dev/wwan0qmi0";

/// How long a synchronous request may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// CTL message ids for client-id management.
const CTL_ALLOCATE_CLIENT_ID: u16 = 0x0022;
const CTL_RELEASE_CLIENT_ID: u16 = 0x0023;
const TLV_CLIENT_ID: u8 = 0x01;

/// Indication callback: `(message id, raw TLV payload)`. Runs on the
/// transport reader thread; implementations must confine themselves to the
/// context they captured.
pub type IndicationHandler = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

struct Shared {
    dev: File,
    /// Serializes frame writes so concurrent requests cannot interleave.
    write_lock: Mutex<()>,
    pending: Mutex<HashMap<(u8, u8, u16), Sender<Frame>>>,
    handlers: Mutex<HashMap<(u8, u8), Arc<IndicationHandler>>>,
    next_tx: AtomicU16,
    running: AtomicBool,
    attached: AtomicUsize,
}

impl Shared {
    fn alloc_tx(&self, ctl: bool) -> u16 {
        loop {
            let tx = self.next_tx.fetch_add(1, Ordering::Relaxed);
            let tx = if ctl { tx & 0x00FF } else { tx };
            if tx != 0 {
                return tx;
            }
        }
    }

    fn roundtrip(
        &self,
        service: ServiceType,
        client: u8,
        msg_id: u16,
        tlvs: &[u8],
    ) -> Result<Tlvs, QmiError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(QmiError::Disconnected);
        }

        let tx_id = self.alloc_tx(service == ServiceType::Ctl);
        let key = (service.as_u8(), client, tx_id);
        let (reply_tx, reply_rx) = bounded(1);
        self.pending.lock().unwrap().insert(key, reply_tx);

        let frame = encode_request(service, client, tx_id, msg_id, tlvs);
        let write_result = {
            let _guard = self.write_lock.lock().unwrap();
            (&self.dev).write_all(&frame)
        };
        if let Err(e) = write_result {
            self.pending.lock().unwrap().remove(&key);
            return Err(QmiError::Transport(e));
        }

        match reply_rx.recv_timeout(REQUEST_TIMEOUT) {
            Ok(frame) => Tlvs::parse(&frame.payload),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                self.pending.lock().unwrap().remove(&key);
                Err(QmiError::Timeout)
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(QmiError::Disconnected)
            }
        }
    }
}

/// Owner of the QMI device node and its reader thread.
pub struct QmuxTransport {
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
    wake_write: i32,
}

impl QmuxTransport {
    /// Open the modem at the fixed device path in direct-interface mode.
    pub fn open() -> Result<Self, QmiError> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(QMI_DEVICE_PATH)?;
        Self::with_device(dev)
    }

    /// Build a transport over an already-open device. The file must be a
    /// bidirectional QMUX endpoint; tests drive this with one end of a
    /// socketpair.
    pub fn with_device(dev: File) -> Result<Self, QmiError> {
        let mut pipe = [0i32; 2];
        if unsafe { libc::pipe(pipe.as_mut_ptr()) } != 0 {
            return Err(QmiError::Transport(std::io::Error::last_os_error()));
        }
        let (wake_read, wake_write) = (pipe[0], pipe[1]);

        let shared = Arc::new(Shared {
            dev,
            write_lock: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_tx: AtomicU16::new(1),
            running: AtomicBool::new(true),
            attached: AtomicUsize::new(0),
        });

        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name("wwand-qmux-reader".into())
            .spawn(move || {
                reader_loop(&reader_shared, wake_read);
                unsafe { libc::close(wake_read) };
            })
            .map_err(QmiError::Transport)?;

        Ok(QmuxTransport {
            shared,
            reader: Some(reader),
            wake_write,
        })
    }

    /// Allocate a client id for `service` and register its indication
    /// handler, if any.
    pub fn attach(
        &self,
        service: ServiceType,
        handler: Option<IndicationHandler>,
    ) -> Result<ServiceClient, QmiError> {
        let mut w = TlvWriter::new();
        w.put_u8(TLV_CLIENT_ID, service.as_u8());
        let tlvs = self
            .shared
            .roundtrip(ServiceType::Ctl, 0, CTL_ALLOCATE_CLIENT_ID, w.finish())?;
        tlvs.check_result()?;

        let raw = tlvs.require(TLV_CLIENT_ID, "allocated client id")?;
        if raw.len() != 2 || raw[0] != service.as_u8() {
            return Err(QmiError::Malformed("client-id allocation mismatch"));
        }
        let client_id = raw[1];

        if let Some(handler) = handler {
            self.shared
                .handlers
                .lock()
                .unwrap()
                .insert((service.as_u8(), client_id), Arc::new(handler));
        }
        self.shared.attached.fetch_add(1, Ordering::Relaxed);
        debug!(service = ?service, client_id, "attached QMI service client");

        Ok(ServiceClient {
            service,
            client_id,
            shared: self.shared.clone(),
        })
    }

    /// Release a client id and unregister its indication handler.
    pub fn detach(&self, client: ServiceClient) -> Result<(), QmiError> {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .remove(&(client.service.as_u8(), client.client_id));
        self.shared.attached.fetch_sub(1, Ordering::Relaxed);

        let mut w = TlvWriter::new();
        w.put_bytes(
            TLV_CLIENT_ID,
            &[client.service.as_u8(), client.client_id],
        );
        let tlvs = self
            .shared
            .roundtrip(ServiceType::Ctl, 0, CTL_RELEASE_CLIENT_ID, w.finish())?;
        tlvs.check_result()?;
        debug!(service = ?client.service, client_id = client.client_id, "detached QMI service client");
        Ok(())
    }

    /// Stop the reader thread and close the device. Idempotent.
    pub fn shutdown(&mut self) {
        let attached = self.shared.attached.load(Ordering::Relaxed);
        debug_assert_eq!(attached, 0, "transport shut down with clients attached");
        if attached != 0 {
            warn!(attached, "shutting down transport with service clients still attached");
        }

        if self.shared.running.swap(false, Ordering::AcqRel) {
            unsafe {
                libc::write(self.wake_write, [1u8].as_ptr().cast(), 1);
            }
            if let Some(handle) = self.reader.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for QmuxTransport {
    fn drop(&mut self) {
        self.shutdown();
        unsafe { libc::close(self.wake_write) };
    }
}

/// A typed attachment to the transport. Created by [`QmuxTransport::attach`]
/// and consumed by [`QmuxTransport::detach`].
pub struct ServiceClient {
    service: ServiceType,
    client_id: u8,
    shared: Arc<Shared>,
}

impl ServiceClient {
    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    /// Issue a synchronous request and return the raw response TLVs without
    /// interpreting the result TLV. Callers that need failure-reason fields
    /// from error responses use this directly.
    pub(crate) fn request_raw(&self, msg_id: u16, tlvs: &[u8]) -> Result<Tlvs, QmiError> {
        self.shared.roundtrip(self.service, self.client_id, msg_id, tlvs)
    }

    /// Issue a synchronous request and fail on a non-success result TLV.
    pub(crate) fn request(&self, msg_id: u16, tlvs: &[u8]) -> Result<Tlvs, QmiError> {
        let tlvs = self.request_raw(msg_id, tlvs)?;
        tlvs.check_result()?;
        Ok(tlvs)
    }
}

// ─── Reader thread ──────────────────────────────────────────────────────

fn reader_loop(shared: &Shared, wake_read: i32) {
    let dev_fd = shared.dev.as_raw_fd();
    let mut accumulator = BytesMut::with_capacity(8192);
    let mut read_buf = [0u8; 8192];

    while shared.running.load(Ordering::Acquire) {
        let mut fds = [
            libc::pollfd {
                fd: dev_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake_read,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "poll on QMI device failed; stopping reader");
            break;
        }
        if fds[1].revents != 0 {
            // Shutdown wake-up.
            break;
        }
        if fds[0].revents == 0 {
            continue;
        }

        match (&shared.dev).read(&mut read_buf) {
            Ok(0) => {
                warn!("QMI device closed by the modem; stopping reader");
                break;
            }
            Ok(n) => {
                accumulator.extend_from_slice(&read_buf[..n]);
                drain_frames(shared, &mut accumulator);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "read from QMI device failed; stopping reader");
                break;
            }
        }
    }

    // Unblock any requester still waiting: dropping the senders turns their
    // recv into a disconnect error.
    shared.running.store(false, Ordering::Release);
    shared.pending.lock().unwrap().clear();
}

fn drain_frames(shared: &Shared, accumulator: &mut BytesMut) {
    loop {
        match decode_frame(accumulator) {
            Ok(Some(frame)) => dispatch_frame(shared, frame),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "dropping undecodable QMUX input");
                accumulator.clear();
                break;
            }
        }
    }
}

fn dispatch_frame(shared: &Shared, frame: Frame) {
    match frame.kind {
        FrameKind::Response => {
            let key = (frame.service, frame.client, frame.tx_id);
            let sender = shared.pending.lock().unwrap().remove(&key);
            match sender {
                // A full channel or dropped receiver means the requester
                // already timed out; the late response is discarded.
                Some(tx) => {
                    let _ = tx.try_send(frame);
                }
                None => {
                    debug!(
                        service = frame.service,
                        client = frame.client,
                        tx_id = frame.tx_id,
                        "response without a waiting requester"
                    );
                }
            }
        }
        FrameKind::Indication => {
            // Client 0xFF is the broadcast address.
            let handlers: Vec<Arc<IndicationHandler>> = {
                let map = shared.handlers.lock().unwrap();
                if frame.client == 0xFF {
                    map.iter()
                        .filter(|((svc, _), _)| *svc == frame.service)
                        .map(|(_, h)| h.clone())
                        .collect()
                } else {
                    map.get(&(frame.service, frame.client))
                        .cloned()
                        .into_iter()
                        .collect()
                }
            };
            if handlers.is_empty() {
                debug!(
                    service = frame.service,
                    client = frame.client,
                    msg_id = frame.msg_id,
                    "indication for a service with no handler"
                );
            }
            for handler in handlers {
                handler(frame.msg_id, &frame.payload);
            }
        }
    }
}
