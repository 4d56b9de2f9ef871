//! Control server session
//!
//! A single-producer control channel driven entirely by `pump()`. The host
//! calls it once per frame; each call does at most one unit of work and
//! never blocks. Any protocol violation, I/O error or disconnect ends the
//! session and releases every image the producer created.

use std::fmt;
use std::fs::{self, Permissions};
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use imgoverlay_proto::{MSG_FRAME_SIZE, Message, MessageKind, Reply, default_socket_path};
use tracing::{debug, error, info, warn};

use crate::error::ControlError;
use crate::fd_transfer;
use crate::registry::{ImageDesc, Limits, Registry};

/// Where the control socket lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem socket, created with mode 0600
    Path(PathBuf),
    /// Linux abstract namespace name (without the leading NUL)
    Abstract(String),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Path(default_socket_path())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Path(path) => write!(f, "{}", path.display()),
            Endpoint::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

impl Endpoint {
    /// Open a blocking client connection to this endpoint
    pub fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Endpoint::Path(path) => UnixStream::connect(path),
            Endpoint::Abstract(name) => {
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixStream::connect_addr(&addr)
            }
        }
    }

    fn bind(&self) -> io::Result<UnixListener> {
        let listener = match self {
            Endpoint::Path(path) => {
                // Leftover from a previous run
                match fs::remove_file(path) {
                    Ok(()) => debug!("Removed stale socket {:?}", path),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(path)?;
                fs::set_permissions(path, Permissions::from_mode(0o600))?;
                listener
            }
            Endpoint::Abstract(name) => {
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                UnixListener::bind_addr(&addr)?
            }
        };
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

/// What a single `pump()` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEvent {
    /// Nothing to do right now
    Idle,
    /// A producer connected
    Connected,
    /// Buffer descriptors for a freshly created image were attached
    BufferAttached { id: u8 },
    /// A request was handled and this reply sent.
    /// An `Error` reply means the session has already been torn down.
    Replied(Reply),
    /// The session ended and all of its images were released
    Disconnected,
}

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bound, no producer connected
    Listening,
    /// Connected, reading the next request frame
    AwaitingMessage,
    /// Connected, waiting for the descriptors of image `id`
    AwaitingFd(u8),
    /// Binding failed; the server never does anything again
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingMessage,
    AwaitingFd(u8),
}

/// The connected producer and its partially read frame
struct Client {
    stream: UnixStream,
    phase: Phase,
    frame: [u8; MSG_FRAME_SIZE],
    filled: usize,
}

impl Client {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            phase: Phase::AwaitingMessage,
            frame: [0; MSG_FRAME_SIZE],
            filled: 0,
        }
    }
}

/// Overlay control server
pub struct ControlServer {
    endpoint: Endpoint,
    listener: Option<UnixListener>,
    client: Option<Client>,
    registry: Registry,
    /// `(dev, ino)` of the socket file we created
    socket_file: Option<(u64, u64)>,
}

/// Identity of the file at `path`, without following symlinks
fn file_identity(path: &Path) -> io::Result<(u64, u64)> {
    let meta = fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

impl ControlServer {
    /// Bind the control socket.
    ///
    /// Never fails: if the socket cannot be bound the error is logged once
    /// and the server stays disabled for the rest of its life.
    pub fn new(endpoint: Endpoint, limits: Limits) -> Self {
        let listener = match endpoint.bind() {
            Ok(listener) => {
                info!("Control server listening on {}", endpoint);
                Some(listener)
            }
            Err(e) => {
                error!("Failed to bind control socket {}: {}, overlay disabled", endpoint, e);
                None
            }
        };

        let socket_file = match (&endpoint, &listener) {
            (Endpoint::Path(path), Some(_)) => match file_identity(path) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Failed to stat socket {:?}: {}", path, e);
                    None
                }
            },
            _ => None,
        };

        Self {
            endpoint,
            listener,
            client: None,
            registry: Registry::new(limits),
            socket_file,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        if self.listener.is_none() {
            return SessionState::Disabled;
        }
        match self.client.as_ref().map(|c| c.phase) {
            None => SessionState::Listening,
            Some(Phase::AwaitingMessage) => SessionState::AwaitingMessage,
            Some(Phase::AwaitingFd(id)) => SessionState::AwaitingFd(id),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Images owned by the current producer
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Perform at most one unit of non-blocking work
    pub fn pump(&mut self) -> PumpEvent {
        if self.listener.is_none() {
            return PumpEvent::Idle;
        }

        let result = match self.client.as_ref().map(|c| c.phase) {
            None => return self.accept(),
            Some(Phase::AwaitingFd(id)) => self.receive_fds(id),
            Some(Phase::AwaitingMessage) => self.receive_message(),
        };

        result.unwrap_or_else(|e| {
            self.teardown(&e);
            PumpEvent::Disconnected
        })
    }

    fn accept(&mut self) -> PumpEvent {
        let Some(listener) = self.listener.as_ref() else {
            return PumpEvent::Idle;
        };

        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("Failed to make producer socket non-blocking: {}", e);
                    return PumpEvent::Idle;
                }
                info!("Producer connected");
                self.client = Some(Client::new(stream));
                PumpEvent::Connected
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::Interrupted
                ) =>
            {
                PumpEvent::Idle
            }
            Err(e) => {
                warn!("Accept error: {}", e);
                PumpEvent::Idle
            }
        }
    }

    fn receive_fds(&mut self, id: u8) -> Result<PumpEvent, ControlError> {
        let Some(client) = self.client.as_mut() else {
            return Ok(PumpEvent::Idle);
        };

        let Some(fds) = fd_transfer::recv_fds(client.stream.as_fd())? else {
            return Ok(PumpEvent::Idle);
        };
        debug!("Received {} descriptor(s) for image {}", fds.len(), id);

        self.registry.attach_buffer(id, fds)?;
        client.phase = Phase::AwaitingMessage;
        Ok(PumpEvent::BufferAttached { id })
    }

    fn receive_message(&mut self) -> Result<PumpEvent, ControlError> {
        let Some(client) = self.client.as_mut() else {
            return Ok(PumpEvent::Idle);
        };

        // Never read past the current frame: the next bytes on the wire may
        // be a descriptor placeholder that must go through recvmsg.
        match client.stream.read(&mut client.frame[client.filled..]) {
            Ok(0) => return Err(ControlError::Disconnected),
            Ok(n) => client.filled += n,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                return Ok(PumpEvent::Idle);
            }
            Err(e) => return Err(e.into()),
        }

        if client.filled < MSG_FRAME_SIZE {
            return Ok(PumpEvent::Idle);
        }
        client.filled = 0;
        let frame = client.frame;

        let reply = match Message::decode(&frame) {
            Ok(msg) => self.handle(&msg),
            Err(e) => {
                warn!("Malformed request frame: {}", e);
                Reply::error(MessageKind::Invalid, 0)
            }
        };

        let Some(client) = self.client.as_mut() else {
            return Ok(PumpEvent::Idle);
        };
        fd_transfer::send_frame(client.stream.as_fd(), &reply.encode())?;

        if !reply.is_ok() {
            self.teardown(&format_args!("{:?} request for image {} failed", reply.kind, reply.id));
        } else if reply.kind == MessageKind::CreateImage {
            client.phase = Phase::AwaitingFd(reply.id);
        }

        Ok(PumpEvent::Replied(reply))
    }

    /// Apply one request and build its reply
    fn handle(&mut self, msg: &Message) -> Reply {
        let kind = msg.kind();
        let id = msg.id().unwrap_or(0);

        match self.dispatch(msg) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Rejected {:?} for image {}: {}", kind, id, e);
                Reply::error(kind, id)
            }
        }
    }

    fn dispatch(&mut self, msg: &Message) -> Result<Reply, ControlError> {
        debug!("Received request: {:?}", msg);

        let reply = match *msg {
            Message::CreateImage(ref create) => {
                self.registry.create(create.id, ImageDesc::from(create))?;
                Reply::ok(MessageKind::CreateImage, create.id)
            }
            Message::UpdateImage(update) => {
                self.registry
                    .update_placement(update.id, update.x, update.y, update.visible)?;
                Reply::ok(MessageKind::UpdateImage, update.id)
            }
            Message::UpdateImageContents { id, buffer } => {
                self.registry.commit_contents(id, buffer)?;
                Reply::ok(MessageKind::UpdateImageContents, id).with_buffer(buffer)
            }
            Message::DestroyImage { id } => {
                self.registry.destroy(id)?;
                Reply::ok(MessageKind::DestroyImage, id)
            }
            Message::DestroyAllImages => {
                self.registry.destroy_all();
                Reply::ok(MessageKind::DestroyAllImages, 0)
            }
        };
        Ok(reply)
    }

    /// Drop the producer and everything it owns, then go back to listening
    fn teardown(&mut self, reason: &dyn fmt::Display) {
        if self.client.take().is_none() {
            return;
        }
        let released = self.registry.destroy_all();
        info!("Producer disconnected ({}), released {} image(s)", reason, released);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.teardown(&"server shutting down");

        if self.listener.take().is_none() {
            return;
        }
        let (Endpoint::Path(path), Some(ours)) = (&self.endpoint, self.socket_file) else {
            return;
        };
        // Another server may have replaced the socket since we bound it
        match file_identity(path) {
            Ok(current) if current == ours => {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Failed to remove socket {:?}: {}", path, e);
                }
            }
            Ok(_) => debug!("Socket {:?} was replaced, leaving it in place", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to stat socket {:?}: {}", path, e),
        }
    }
}
