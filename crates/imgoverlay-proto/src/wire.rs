//! Fixed-layout binary frames for the control channel.
//!
//! # Frame layout
//!
//! Requests are always [`MSG_FRAME_SIZE`] bytes, replies [`REPLY_FRAME_SIZE`].
//! Integers are host-native byte order; both ends live on the same machine.
//! Field offsets follow the natural C layout of the request structs, so a
//! producer written against the C ABI interoperates unchanged:
//!
//! ```text
//! request:  [0] u32 kind  [8..] payload (see each message)
//! reply:    [0] u32 status  [4] u32 kind  [8] u8 id  [9] u8 buffer  [10..16] zero
//! ```
//!
//! Unused bytes are written as zero and ignored on decode.

use thiserror::Error;

/// Size of every request frame.
pub const MSG_FRAME_SIZE: usize = 128;

/// Size of every reply frame.
pub const REPLY_FRAME_SIZE: usize = 16;

/// Maximum number of DMA-BUF planes per image.
pub const MAX_PLANES: usize = 4;

/// Offset of the message payload (the payload union is 8-byte aligned).
const PAYLOAD: usize = 8;

// CreateImage field offsets
const CI_ID: usize = PAYLOAD;
const CI_X: usize = PAYLOAD + 4;
const CI_Y: usize = PAYLOAD + 8;
const CI_WIDTH: usize = PAYLOAD + 12;
const CI_HEIGHT: usize = PAYLOAD + 16;
const CI_VISIBLE: usize = PAYLOAD + 20;
const CI_FLIP: usize = PAYLOAD + 21;
const CI_PLANES: usize = PAYLOAD + 22;
const CI_SHM_SIZE: usize = PAYLOAD + 24;
const CI_FORMAT: usize = PAYLOAD + 28;
const CI_MODIFIER: usize = PAYLOAD + 32;
const CI_STRIDES: usize = PAYLOAD + 40;
const CI_OFFSETS: usize = PAYLOAD + 56;

// UpdateImage field offsets
const UI_ID: usize = PAYLOAD;
const UI_X: usize = PAYLOAD + 4;
const UI_Y: usize = PAYLOAD + 8;
const UI_VISIBLE: usize = PAYLOAD + 12;

// UpdateImageContents field offsets
const UC_ID: usize = PAYLOAD;
const UC_BUFFER: usize = PAYLOAD + 1;

// DestroyImage field offsets
const DI_ID: usize = PAYLOAD;

// Reply field offsets
const R_STATUS: usize = 0;
const R_KIND: usize = 4;
const R_ID: usize = 8;
const R_BUFFER: usize = 9;

/// Errors produced while decoding a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame too short: {got} bytes, expected {expected}")]
    ShortFrame { got: usize, expected: usize },

    #[error("unknown message kind 0x{0:08x}")]
    UnknownKind(u32),

    #[error("unknown reply status {0}")]
    UnknownStatus(u32),
}

/// Message kind tag, the first field of every request frame.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CreateImage = 1,
    UpdateImage = 2,
    UpdateImageContents = 3,
    DestroyImage = 4,
    DestroyAllImages = 5,
    /// Sentinel for frames whose kind could not be decoded
    Invalid = 0xFFFF_FFFF,
}

impl MessageKind {
    /// Map a raw tag to a kind; anything unknown becomes `Invalid`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::CreateImage,
            2 => Self::UpdateImage,
            3 => Self::UpdateImageContents,
            4 => Self::DestroyImage,
            5 => Self::DestroyAllImages,
            _ => Self::Invalid,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Reply status
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

/// Payload of a `CreateImage` request.
///
/// A non-zero `shm_size` selects a shared-memory image (one memfd follows),
/// zero selects a DMA-BUF image (`plane_count` plane fds follow). The
/// format/modifier/stride/offset fields only matter for DMA-BUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateImage {
    pub id: u8,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
    /// Contents are stored bottom-up
    pub flip: bool,
    pub plane_count: u8,
    pub shm_size: u32,
    /// DRM fourcc
    pub format: i32,
    /// DRM format modifier
    pub modifier: u64,
    pub strides: [i32; MAX_PLANES],
    pub offsets: [i32; MAX_PLANES],
}

impl CreateImage {
    pub fn is_dmabuf(&self) -> bool {
        self.shm_size == 0
    }
}

/// Payload of an `UpdateImage` request (placement and visibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateImage {
    pub id: u8,
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

/// A decoded producer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    CreateImage(CreateImage),
    UpdateImage(UpdateImage),
    /// Commit buffer half `buffer` (0 = front, 1 = back) as current contents
    UpdateImageContents { id: u8, buffer: u8 },
    DestroyImage { id: u8 },
    DestroyAllImages,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::CreateImage(_) => MessageKind::CreateImage,
            Message::UpdateImage(_) => MessageKind::UpdateImage,
            Message::UpdateImageContents { .. } => MessageKind::UpdateImageContents,
            Message::DestroyImage { .. } => MessageKind::DestroyImage,
            Message::DestroyAllImages => MessageKind::DestroyAllImages,
        }
    }

    /// Image id addressed by this message (`None` for `DestroyAllImages`)
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::CreateImage(m) => Some(m.id),
            Message::UpdateImage(m) => Some(m.id),
            Message::UpdateImageContents { id, .. } => Some(*id),
            Message::DestroyImage { id } => Some(*id),
            Message::DestroyAllImages => None,
        }
    }

    /// Encode into a zero-padded request frame
    pub fn encode(&self) -> [u8; MSG_FRAME_SIZE] {
        let mut buf = [0u8; MSG_FRAME_SIZE];
        put_u32(&mut buf, 0, self.kind().as_raw());

        match self {
            Message::CreateImage(m) => {
                buf[CI_ID] = m.id;
                put_i32(&mut buf, CI_X, m.x);
                put_i32(&mut buf, CI_Y, m.y);
                put_u32(&mut buf, CI_WIDTH, m.width);
                put_u32(&mut buf, CI_HEIGHT, m.height);
                buf[CI_VISIBLE] = m.visible as u8;
                buf[CI_FLIP] = m.flip as u8;
                buf[CI_PLANES] = m.plane_count;
                put_u32(&mut buf, CI_SHM_SIZE, m.shm_size);
                put_i32(&mut buf, CI_FORMAT, m.format);
                put_u64(&mut buf, CI_MODIFIER, m.modifier);
                for i in 0..MAX_PLANES {
                    put_i32(&mut buf, CI_STRIDES + i * 4, m.strides[i]);
                    put_i32(&mut buf, CI_OFFSETS + i * 4, m.offsets[i]);
                }
            }
            Message::UpdateImage(m) => {
                buf[UI_ID] = m.id;
                put_i32(&mut buf, UI_X, m.x);
                put_i32(&mut buf, UI_Y, m.y);
                buf[UI_VISIBLE] = m.visible as u8;
            }
            Message::UpdateImageContents { id, buffer } => {
                buf[UC_ID] = *id;
                buf[UC_BUFFER] = *buffer;
            }
            Message::DestroyImage { id } => {
                buf[DI_ID] = *id;
            }
            Message::DestroyAllImages => {}
        }

        buf
    }

    /// Decode a request frame. Only the first [`MSG_FRAME_SIZE`] bytes are read.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, MSG_FRAME_SIZE)?;

        let raw = get_u32(buf, 0);
        let msg = match MessageKind::from_raw(raw) {
            MessageKind::CreateImage => {
                let mut strides = [0i32; MAX_PLANES];
                let mut offsets = [0i32; MAX_PLANES];
                for i in 0..MAX_PLANES {
                    strides[i] = get_i32(buf, CI_STRIDES + i * 4);
                    offsets[i] = get_i32(buf, CI_OFFSETS + i * 4);
                }
                Message::CreateImage(CreateImage {
                    id: buf[CI_ID],
                    x: get_i32(buf, CI_X),
                    y: get_i32(buf, CI_Y),
                    width: get_u32(buf, CI_WIDTH),
                    height: get_u32(buf, CI_HEIGHT),
                    visible: buf[CI_VISIBLE] != 0,
                    flip: buf[CI_FLIP] != 0,
                    plane_count: buf[CI_PLANES],
                    shm_size: get_u32(buf, CI_SHM_SIZE),
                    format: get_i32(buf, CI_FORMAT),
                    modifier: get_u64(buf, CI_MODIFIER),
                    strides,
                    offsets,
                })
            }
            MessageKind::UpdateImage => Message::UpdateImage(UpdateImage {
                id: buf[UI_ID],
                x: get_i32(buf, UI_X),
                y: get_i32(buf, UI_Y),
                visible: buf[UI_VISIBLE] != 0,
            }),
            MessageKind::UpdateImageContents => Message::UpdateImageContents {
                id: buf[UC_ID],
                buffer: buf[UC_BUFFER],
            },
            MessageKind::DestroyImage => Message::DestroyImage { id: buf[DI_ID] },
            MessageKind::DestroyAllImages => Message::DestroyAllImages,
            MessageKind::Invalid => return Err(WireError::UnknownKind(raw)),
        };

        Ok(msg)
    }
}

/// Server reply, echoing the request's kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub kind: MessageKind,
    pub id: u8,
    /// Committed buffer half, only meaningful for `UpdateImageContents`
    pub buffer: u8,
}

impl Reply {
    pub fn ok(kind: MessageKind, id: u8) -> Self {
        Self { status: Status::Ok, kind, id, buffer: 0 }
    }

    pub fn error(kind: MessageKind, id: u8) -> Self {
        Self { status: Status::Error, kind, id, buffer: 0 }
    }

    pub fn with_buffer(mut self, buffer: u8) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Encode into a zero-padded reply frame
    pub fn encode(&self) -> [u8; REPLY_FRAME_SIZE] {
        let mut buf = [0u8; REPLY_FRAME_SIZE];
        put_u32(&mut buf, R_STATUS, self.status as u32);
        put_u32(&mut buf, R_KIND, self.kind.as_raw());
        buf[R_ID] = self.id;
        buf[R_BUFFER] = self.buffer;
        buf
    }

    /// Decode a reply frame. An unknown kind decodes as `Invalid`, since the
    /// server echoes whatever tag it could not understand.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, REPLY_FRAME_SIZE)?;

        let status = match get_u32(buf, R_STATUS) {
            0 => Status::Ok,
            1 => Status::Error,
            other => return Err(WireError::UnknownStatus(other)),
        };

        Ok(Self {
            status,
            kind: MessageKind::from_raw(get_u32(buf, R_KIND)),
            id: buf[R_ID],
            buffer: buf[R_BUFFER],
        })
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), WireError> {
    if buf.len() < expected {
        return Err(WireError::ShortFrame { got: buf.len(), expected });
    }
    Ok(())
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn get_i32(buf: &[u8], off: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    i32::from_ne_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_create() -> CreateImage {
        CreateImage {
            id: 7,
            x: -20,
            y: 300,
            width: 640,
            height: 480,
            visible: true,
            flip: true,
            plane_count: 2,
            shm_size: 0,
            format: 0x3432_4241, // 'AB24'
            modifier: 0x0100_0000_0000_0002,
            strides: [2560, 1280, 0, 0],
            offsets: [0, 1_228_800, 0, 0],
        }
    }

    #[test]
    fn test_create_image_roundtrip() {
        let msg = Message::CreateImage(sample_create());
        let frame = msg.encode();
        assert_eq!(frame.len(), MSG_FRAME_SIZE);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_every_message_kind_roundtrips() {
        let messages = [
            Message::UpdateImage(UpdateImage { id: 3, x: -1, y: i32::MAX, visible: true }),
            Message::UpdateImageContents { id: 255, buffer: 1 },
            Message::DestroyImage { id: 0 },
            Message::DestroyAllImages,
        ];
        for msg in messages {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }

        let replies = [
            Reply::ok(MessageKind::CreateImage, 1),
            Reply::error(MessageKind::Invalid, 0),
            Reply::ok(MessageKind::UpdateImageContents, 9).with_buffer(1),
        ];
        for reply in replies {
            let frame = reply.encode();
            assert_eq!(frame.len(), REPLY_FRAME_SIZE);
            assert_eq!(Reply::decode(&frame).unwrap(), reply);
        }
    }

    #[test]
    fn test_create_image_field_offsets() {
        let frame = Message::CreateImage(sample_create()).encode();
        assert_eq!(u32::from_ne_bytes(frame[0..4].try_into().unwrap()), 1);
        assert_eq!(frame[8], 7);
        assert_eq!(i32::from_ne_bytes(frame[12..16].try_into().unwrap()), -20);
        assert_eq!(u32::from_ne_bytes(frame[20..24].try_into().unwrap()), 640);
        assert_eq!(u32::from_ne_bytes(frame[24..28].try_into().unwrap()), 480);
        assert_eq!(&frame[28..31], &[1, 1, 2]);
        assert_eq!(
            u64::from_ne_bytes(frame[40..48].try_into().unwrap()),
            0x0100_0000_0000_0002
        );
        assert_eq!(i32::from_ne_bytes(frame[52..56].try_into().unwrap()), 1280);
        assert_eq!(i32::from_ne_bytes(frame[68..72].try_into().unwrap()), 1_228_800);
        // Everything past the offsets array is padding
        assert!(frame[80..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_update_contents_layout() {
        let frame = Message::UpdateImageContents { id: 4, buffer: 1 }.encode();
        assert_eq!(u32::from_ne_bytes(frame[0..4].try_into().unwrap()), 3);
        assert_eq!(frame[8], 4);
        assert_eq!(frame[9], 1);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut frame = [0u8; MSG_FRAME_SIZE];
        frame[0..4].copy_from_slice(&42u32.to_ne_bytes());
        assert_eq!(Message::decode(&frame), Err(WireError::UnknownKind(42)));

        // A zeroed frame has kind 0, which is not a valid message either
        assert_eq!(
            Message::decode(&[0u8; MSG_FRAME_SIZE]),
            Err(WireError::UnknownKind(0))
        );
    }

    #[test]
    fn test_short_frames() {
        assert_eq!(
            Message::decode(&[0u8; 64]),
            Err(WireError::ShortFrame { got: 64, expected: MSG_FRAME_SIZE })
        );
        assert_eq!(
            Reply::decode(&[0u8; 8]),
            Err(WireError::ShortFrame { got: 8, expected: REPLY_FRAME_SIZE })
        );
    }

    #[test]
    fn test_reply_echoes_unknown_kind_as_invalid() {
        let mut frame = Reply::error(MessageKind::Invalid, 5).encode();
        assert_eq!(u32::from_ne_bytes(frame[4..8].try_into().unwrap()), 0xFFFF_FFFF);
        frame[4..8].copy_from_slice(&77u32.to_ne_bytes());
        assert_eq!(Reply::decode(&frame).unwrap().kind, MessageKind::Invalid);
        assert!(frame[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_reply_status() {
        let mut frame = Reply::ok(MessageKind::DestroyImage, 1).encode();
        frame[0..4].copy_from_slice(&9u32.to_ne_bytes());
        assert_eq!(Reply::decode(&frame), Err(WireError::UnknownStatus(9)));
    }
}
