//! Producer side of the control channel
//!
//! A small blocking client used by overlay producers (and by the tests) to
//! create images and push contents. Shared-memory images are double
//! buffered: the producer draws into the back half, commits it with
//! `UpdateImageContents`, and must wait for the reply before touching the
//! buffers again.

use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use imgoverlay_proto::{
    CreateImage, Message, MessageKind, REPLY_FRAME_SIZE, Reply, double_buffer_size, half_size,
};
use tracing::{debug, info};

use crate::fd_transfer;
use crate::session::Endpoint;
use crate::shm::{ShmMapping, create_memfd, seal_size};

/// Blocking connection to an overlay control server
pub struct Producer {
    stream: UnixStream,
}

impl Producer {
    /// Connect to the server at `endpoint`
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        info!("Connecting to overlay at {}", endpoint);
        let stream = endpoint
            .connect()
            .with_context(|| format!("Failed to connect to overlay socket {}", endpoint))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Bound how long `read_reply` may block
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .context("Failed to set read timeout")
    }

    /// Send one request frame
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        debug!("Sending request: {:?}", msg);
        fd_transfer::send_frame(self.stream.as_fd(), &msg.encode())
            .with_context(|| format!("Failed to send {:?}", msg.kind()))
    }

    /// Send buffer descriptors following a `CreateImage`
    pub fn send_fds(&mut self, fds: &[BorrowedFd<'_>]) -> Result<()> {
        fd_transfer::send_fds(self.stream.as_fd(), fds).context("Failed to send descriptors")
    }

    /// Block until the next reply arrives
    pub fn read_reply(&mut self) -> Result<Reply> {
        let mut buf = [0u8; REPLY_FRAME_SIZE];
        self.stream
            .read_exact(&mut buf)
            .context("Failed to read reply")?;
        let reply = Reply::decode(&buf)?;
        debug!("Received reply: {:?}", reply);
        Ok(reply)
    }

    /// Register a shared-memory image and hand over its memfd.
    ///
    /// Does not wait for the reply.
    pub fn create_shm_image(
        &mut self,
        image: &SharedImage,
        x: i32,
        y: i32,
        visible: bool,
    ) -> Result<()> {
        self.send(&image.create_message(x, y, visible))?;
        self.send_fds(&[image.fd()])
    }
}

/// A memfd-backed double-buffered RGBA image owned by the producer
pub struct SharedImage {
    id: u8,
    width: u32,
    height: u32,
    mapping: ShmMapping,
    front: Option<u8>,
    pending: Option<u8>,
}

impl SharedImage {
    /// Allocate and seal a `2 * width * height * 4` byte memfd
    pub fn new(id: u8, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Invalid image size {}x{}", width, height);
        }
        let size = double_buffer_size(width, height);
        let len = usize::try_from(size).context("Image too large")?;
        u32::try_from(size).context("Image too large")?;

        let fd = create_memfd(&format!("imgoverlay-{}", id), size)
            .context("Failed to create shared memory")?;
        let mapping = ShmMapping::map_readwrite(fd, len).context("Failed to map shared memory")?;
        seal_size(mapping.fd()).context("Failed to seal shared memory")?;

        Ok(Self {
            id,
            width,
            height,
            mapping,
            front: None,
            pending: None,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.mapping.fd()
    }

    /// Half currently shown by the server, if any was committed
    pub fn committed_half(&self) -> Option<u8> {
        self.front
    }

    /// Whether a contents update still awaits its reply
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The `CreateImage` request describing this image
    pub fn create_message(&self, x: i32, y: i32, visible: bool) -> Message {
        Message::CreateImage(CreateImage {
            id: self.id,
            x,
            y,
            width: self.width,
            height: self.height,
            visible,
            shm_size: self.mapping.len() as u32,
            ..Default::default()
        })
    }

    fn back_half(&self) -> u8 {
        match self.front {
            Some(front) => 1 - front,
            None => 0,
        }
    }

    /// Pixels of the half that is not being displayed
    pub fn back_buffer_mut(&mut self) -> Result<&mut [u8]> {
        if self.pending.is_some() {
            bail!("Image {} has an unacknowledged contents update", self.id);
        }
        let half_len = half_size(self.width, self.height) as usize;
        let start = self.back_half() as usize * half_len;
        let pixels = self
            .mapping
            .as_mut_slice()
            .context("Shared memory mapped read-only")?;
        Ok(&mut pixels[start..start + half_len])
    }

    /// Commit the back half; send the returned message and `ack` its reply
    pub fn flip(&mut self) -> Result<Message> {
        if self.pending.is_some() {
            bail!("Image {} has an unacknowledged contents update", self.id);
        }
        let half = self.back_half();
        self.pending = Some(half);
        Ok(Message::UpdateImageContents { id: self.id, buffer: half })
    }

    /// Consume the reply to the last `flip`.
    ///
    /// Replies for other images or requests are ignored.
    pub fn ack(&mut self, reply: &Reply) -> Result<()> {
        if reply.kind != MessageKind::UpdateImageContents || reply.id != self.id {
            return Ok(());
        }
        let Some(half) = self.pending.take() else {
            return Ok(());
        };
        if !reply.is_ok() {
            bail!("Server rejected contents update for image {}", self.id);
        }
        if reply.buffer != half {
            bail!("Server committed half {} instead of {}", reply.buffer, half);
        }
        self.front = Some(half);
        Ok(())
    }
}
