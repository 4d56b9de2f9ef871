//! Image registry
//!
//! Maps 8-bit image ids to their geometry, visibility and backing store.
//! Entries are created unattached by `CreateImage` and only become visible
//! to the compositor once their buffer descriptors have arrived and been
//! mapped (shared memory) or retained (DMA-BUF).
//!
//! All OS resources are owned by the entries: removing an entry unmaps its
//! memory and closes its descriptors.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use imgoverlay_proto::{CreateImage, MAX_PLANES, double_buffer_size, half_size};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::shm::{ShmMapping, is_shrink_sealed};

/// Default maximum number of live images
pub const DEFAULT_MAX_IMAGES: usize = 16;

/// Default ceiling on a shared-memory double buffer (both halves)
pub const DEFAULT_MAX_SHM_BYTES: u32 = 20 * 1024 * 1024;

/// Resource limits applied to a single producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_images: usize,
    pub max_shm_bytes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            max_shm_bytes: DEFAULT_MAX_SHM_BYTES,
        }
    }
}

/// Image placement and size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// What kind of buffer backs an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Double-buffered memfd region of `size` bytes
    SharedMemory { size: u32 },
    /// GPU buffer exported as 1-4 DMA-BUF planes
    DmaBuf {
        plane_count: u8,
        format: i32,
        modifier: u64,
        strides: [i32; MAX_PLANES],
        offsets: [i32; MAX_PLANES],
    },
}

/// Everything `create` needs to register an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub geometry: Geometry,
    pub visible: bool,
    pub flip: bool,
    pub backing: Backing,
}

impl From<&CreateImage> for ImageDesc {
    fn from(m: &CreateImage) -> Self {
        let backing = if m.is_dmabuf() {
            Backing::DmaBuf {
                plane_count: m.plane_count,
                format: m.format,
                modifier: m.modifier,
                strides: m.strides,
                offsets: m.offsets,
            }
        } else {
            Backing::SharedMemory { size: m.shm_size }
        };

        Self {
            geometry: Geometry::new(m.x, m.y, m.width, m.height),
            visible: m.visible,
            flip: m.flip,
            backing,
        }
    }
}

/// Resources received for an image
#[derive(Debug)]
enum Attachment {
    SharedMemory(ShmMapping),
    DmaBuf(Vec<OwnedFd>),
}

#[derive(Debug)]
struct Image {
    desc: ImageDesc,
    committed_half: Option<u8>,
    serial: u64,
    commit_serial: u64,
    attachment: Option<Attachment>,
}

impl Image {
    fn view(&self, id: u8) -> Option<ImageView<'_>> {
        let content = match self.attachment.as_ref()? {
            Attachment::SharedMemory(mapping) => {
                let half_len = half_size(self.desc.geometry.width, self.desc.geometry.height) as usize;
                let pixels = self.committed_half.and_then(|half| {
                    let start = half as usize * half_len;
                    mapping.as_slice().get(start..start + half_len)
                });
                ImageContent::SharedMemory {
                    committed_half: self.committed_half,
                    pixels,
                }
            }
            Attachment::DmaBuf(fds) => {
                let Backing::DmaBuf { format, modifier, strides, offsets, .. } = self.desc.backing
                else {
                    return None;
                };
                ImageContent::DmaBuf {
                    format,
                    modifier,
                    planes: fds
                        .iter()
                        .enumerate()
                        .map(|(i, fd)| PlaneView {
                            fd: fd.as_fd(),
                            stride: strides[i],
                            offset: offsets[i],
                        })
                        .collect(),
                }
            }
        };

        Some(ImageView {
            id,
            geometry: self.desc.geometry,
            visible: self.desc.visible,
            flip: self.desc.flip,
            serial: self.serial,
            commit_serial: self.commit_serial,
            content,
        })
    }
}

/// One DMA-BUF plane as seen by the compositor
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    pub fd: BorrowedFd<'a>,
    pub stride: i32,
    pub offset: i32,
}

/// Drawable contents of an image
#[derive(Debug, Clone)]
pub enum ImageContent<'a> {
    SharedMemory {
        /// `None` until the producer commits a half for the first time
        committed_half: Option<u8>,
        /// The committed half, `width * height * 4` bytes of RGBA.
        /// Live shared memory: a misbehaving producer can tear it while
        /// it is read. See `ImageView::copy_pixels`.
        pixels: Option<&'a [u8]>,
    },
    DmaBuf {
        format: i32,
        modifier: u64,
        planes: Vec<PlaneView<'a>>,
    },
}

/// Read-only view of an attached image
#[derive(Debug, Clone)]
pub struct ImageView<'a> {
    pub id: u8,
    pub geometry: Geometry,
    pub visible: bool,
    pub flip: bool,
    /// Changes whenever the id is bound to a new image
    pub serial: u64,
    /// Changes on every accepted content commit
    pub commit_serial: u64,
    pub content: ImageContent<'a>,
}

impl ImageView<'_> {
    /// Copy out the committed half of a shared-memory image.
    ///
    /// The copy cannot change after it is taken, unlike `pixels`.
    pub fn copy_pixels(&self) -> Option<Vec<u8>> {
        match self.content {
            ImageContent::SharedMemory { pixels: Some(pixels), .. } => Some(pixels.to_vec()),
            _ => None,
        }
    }
}

/// Registry of images owned by the current producer
#[derive(Debug, Default)]
pub struct Registry {
    images: HashMap<u8, Image>,
    limits: Limits,
    next_serial: u64,
}

impl Registry {
    pub fn new(limits: Limits) -> Self {
        Self {
            images: HashMap::new(),
            limits,
            next_serial: 0,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Number of live images, attached or not
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.images.contains_key(&id)
    }

    pub fn is_attached(&self, id: u8) -> bool {
        self.images
            .get(&id)
            .is_some_and(|img| img.attachment.is_some())
    }

    /// Register a new, not yet attached image.
    ///
    /// A failed create leaves the registry untouched.
    pub fn create(&mut self, id: u8, desc: ImageDesc) -> Result<(), ControlError> {
        let Geometry { width, height, .. } = desc.geometry;
        if width == 0 || height == 0 {
            return Err(ControlError::InvalidSize { width, height });
        }

        match desc.backing {
            Backing::SharedMemory { size } => {
                let expected = double_buffer_size(width, height);
                if size as u64 != expected || size > self.limits.max_shm_bytes {
                    return Err(ControlError::InvalidBufferSize {
                        size,
                        expected,
                        limit: self.limits.max_shm_bytes,
                    });
                }
            }
            Backing::DmaBuf { plane_count, .. } => {
                if plane_count == 0 || plane_count as usize > MAX_PLANES {
                    return Err(ControlError::InvalidPlaneCount(plane_count));
                }
            }
        }

        if self.images.contains_key(&id) {
            return Err(ControlError::DuplicateId(id));
        }

        if self.images.len() >= self.limits.max_images {
            return Err(ControlError::CapacityExceeded(self.limits.max_images));
        }

        self.next_serial += 1;
        self.images.insert(
            id,
            Image {
                desc,
                committed_half: None,
                serial: self.next_serial,
                commit_serial: 0,
                attachment: None,
            },
        );

        debug!("Created image {} ({}x{})", id, width, height);
        Ok(())
    }

    /// Attach the descriptors received for image `id`.
    ///
    /// Shared memory must be sealed against shrinking and is then mapped
    /// read-only over its full double-buffer size;
    /// DMA-BUF plane descriptors are retained for the compositor to import.
    /// Descriptors beyond what the image needs are closed.
    pub fn attach_buffer(&mut self, id: u8, fds: Vec<OwnedFd>) -> Result<(), ControlError> {
        let image = self.images.get_mut(&id).ok_or(ControlError::UnknownId(id))?;
        if image.attachment.is_some() {
            return Err(ControlError::FdTransferFailed(format!(
                "image {} already has a buffer",
                id
            )));
        }

        let mut fds = fds.into_iter();
        let attachment = match image.desc.backing {
            Backing::SharedMemory { size } => {
                let fd = fds.next().ok_or_else(|| {
                    ControlError::FdTransferFailed("no shared memory descriptor".into())
                })?;
                match is_shrink_sealed(fd.as_fd()) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(ControlError::MappingFailed {
                            id,
                            reason: "buffer is not sealed against shrinking".into(),
                        });
                    }
                    Err(e) => {
                        return Err(ControlError::MappingFailed {
                            id,
                            reason: format!("cannot read buffer seals: {}", e),
                        });
                    }
                }
                let mapping = ShmMapping::map_readonly(fd, size as usize).map_err(|e| {
                    ControlError::MappingFailed { id, reason: e.to_string() }
                })?;
                Attachment::SharedMemory(mapping)
            }
            Backing::DmaBuf { plane_count, .. } => {
                let planes: Vec<OwnedFd> = fds.by_ref().take(plane_count as usize).collect();
                if planes.len() < plane_count as usize {
                    return Err(ControlError::FdTransferFailed(format!(
                        "expected {} plane descriptors, got {}",
                        plane_count,
                        planes.len()
                    )));
                }
                Attachment::DmaBuf(planes)
            }
        };

        let surplus = fds.count();
        if surplus > 0 {
            warn!("Closed {} surplus descriptor(s) for image {}", surplus, id);
        }

        image.attachment = Some(attachment);
        debug!("Attached buffer to image {}", id);
        Ok(())
    }

    /// Move and show/hide an image
    pub fn update_placement(
        &mut self,
        id: u8,
        x: i32,
        y: i32,
        visible: bool,
    ) -> Result<(), ControlError> {
        let image = self.images.get_mut(&id).ok_or(ControlError::UnknownId(id))?;
        image.desc.geometry.x = x;
        image.desc.geometry.y = y;
        image.desc.visible = visible;
        Ok(())
    }

    /// Make buffer half `half` (0 or 1) the current contents
    pub fn commit_contents(&mut self, id: u8, half: u8) -> Result<(), ControlError> {
        let image = self.images.get_mut(&id).ok_or(ControlError::UnknownId(id))?;
        if half > 1 {
            return Err(ControlError::InvalidBufferHalf(half));
        }
        image.committed_half = Some(half);
        image.commit_serial += 1;
        Ok(())
    }

    /// Remove an image, releasing its memory and descriptors
    pub fn destroy(&mut self, id: u8) -> Result<(), ControlError> {
        self.images.remove(&id).ok_or(ControlError::UnknownId(id))?;
        debug!("Destroyed image {}", id);
        Ok(())
    }

    /// Remove every image; returns how many were removed
    pub fn destroy_all(&mut self) -> usize {
        let count = self.images.len();
        self.images.clear();
        if count > 0 {
            debug!("Destroyed all {} images", count);
        }
        count
    }

    /// Point-in-time view of every attached image, keyed by id
    pub fn snapshot(&self) -> BTreeMap<u8, ImageView<'_>> {
        self.images
            .iter()
            .filter_map(|(&id, img)| img.view(id).map(|view| (id, view)))
            .collect()
    }

    /// View of a single attached image
    pub fn get(&self, id: u8) -> Option<ImageView<'_>> {
        self.images.get(&id)?.view(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{create_memfd, seal_size};

    fn shm_desc(width: u32, height: u32) -> ImageDesc {
        ImageDesc {
            geometry: Geometry::new(0, 0, width, height),
            visible: false,
            flip: false,
            backing: Backing::SharedMemory {
                size: double_buffer_size(width, height) as u32,
            },
        }
    }

    fn dmabuf_desc(plane_count: u8) -> ImageDesc {
        ImageDesc {
            geometry: Geometry::new(10, 20, 256, 128),
            visible: true,
            flip: true,
            backing: Backing::DmaBuf {
                plane_count,
                format: 0x3432_5258,
                modifier: 0,
                strides: [1024, 512, 0, 0],
                offsets: [0, 131_072, 0, 0],
            },
        }
    }

    fn memfd_for(width: u32, height: u32) -> OwnedFd {
        let fd = create_memfd("registry-test", double_buffer_size(width, height)).unwrap();
        seal_size(fd.as_fd()).unwrap();
        fd
    }

    #[test]
    fn test_image_visible_only_after_attach() {
        let mut reg = Registry::new(Limits::default());
        reg.create(1, shm_desc(64, 64)).unwrap();

        assert!(reg.contains(1));
        assert!(!reg.is_attached(1));
        assert!(reg.snapshot().is_empty());

        reg.attach_buffer(1, vec![memfd_for(64, 64)]).unwrap();
        let snap = reg.snapshot();
        let view = &snap[&1];
        assert_eq!(view.geometry, Geometry::new(0, 0, 64, 64));
        assert!(!view.visible);
        assert!(matches!(
            view.content,
            ImageContent::SharedMemory { committed_half: None, pixels: None }
        ));
    }

    #[test]
    fn test_create_rejections_leave_registry_untouched() {
        let mut reg = Registry::new(Limits::default());

        assert!(matches!(
            reg.create(1, shm_desc(0, 64)),
            Err(ControlError::InvalidSize { width: 0, height: 64 })
        ));

        let mut wrong_size = shm_desc(64, 64);
        wrong_size.backing = Backing::SharedMemory { size: 64 * 64 * 4 };
        assert!(matches!(
            reg.create(1, wrong_size),
            Err(ControlError::InvalidBufferSize { .. })
        ));

        // 2048x2048 double-buffered is 32 MiB, over the 20 MiB ceiling
        assert!(matches!(
            reg.create(1, shm_desc(2048, 2048)),
            Err(ControlError::InvalidBufferSize { .. })
        ));

        assert!(matches!(
            reg.create(1, dmabuf_desc(0)),
            Err(ControlError::InvalidPlaneCount(0))
        ));
        assert!(matches!(
            reg.create(1, dmabuf_desc(5)),
            Err(ControlError::InvalidPlaneCount(5))
        ));

        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_id_while_awaiting_fd() {
        let mut reg = Registry::new(Limits::default());
        reg.create(3, shm_desc(32, 32)).unwrap();
        assert!(matches!(
            reg.create(3, shm_desc(16, 16)),
            Err(ControlError::DuplicateId(3))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut reg = Registry::new(Limits { max_images: 2, ..Limits::default() });
        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.create(2, shm_desc(8, 8)).unwrap();
        assert!(matches!(
            reg.create(3, shm_desc(8, 8)),
            Err(ControlError::CapacityExceeded(2))
        ));
        assert_eq!(reg.len(), 2);

        reg.destroy(1).unwrap();
        reg.create(3, shm_desc(8, 8)).unwrap();
    }

    #[test]
    fn test_commit_selects_half() {
        let mut reg = Registry::new(Limits::default());
        let fd = memfd_for(4, 4);
        let mut writer = ShmMapping::map_readwrite(fd.try_clone().unwrap(), 128).unwrap();
        {
            let pixels = writer.as_mut_slice().unwrap();
            pixels[..64].fill(0x11);
            pixels[64..].fill(0x22);
        }

        reg.create(5, shm_desc(4, 4)).unwrap();
        reg.attach_buffer(5, vec![fd]).unwrap();

        reg.commit_contents(5, 1).unwrap();
        let view = reg.get(5).unwrap();
        match view.content {
            ImageContent::SharedMemory { committed_half, pixels } => {
                assert_eq!(committed_half, Some(1));
                let pixels = pixels.unwrap();
                assert_eq!(pixels.len(), 64);
                assert!(pixels.iter().all(|&b| b == 0x22));
            }
            other => panic!("unexpected content {:?}", other),
        }
        assert_eq!(view.commit_serial, 1);

        reg.commit_contents(5, 0).unwrap();
        match reg.get(5).unwrap().content {
            ImageContent::SharedMemory { pixels: Some(p), .. } => assert_eq!(p[0], 0x11),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_invalid_half_keeps_previous() {
        let mut reg = Registry::new(Limits::default());
        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.attach_buffer(1, vec![memfd_for(8, 8)]).unwrap();
        reg.commit_contents(1, 1).unwrap();

        assert!(matches!(
            reg.commit_contents(1, 2),
            Err(ControlError::InvalidBufferHalf(2))
        ));
        let view = reg.get(1).unwrap();
        assert_eq!(view.commit_serial, 1);
        assert!(matches!(
            view.content,
            ImageContent::SharedMemory { committed_half: Some(1), .. }
        ));

        assert!(matches!(reg.commit_contents(9, 0), Err(ControlError::UnknownId(9))));
    }

    #[test]
    fn test_update_placement() {
        let mut reg = Registry::new(Limits::default());
        assert!(matches!(
            reg.update_placement(1, 0, 0, true),
            Err(ControlError::UnknownId(1))
        ));

        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.attach_buffer(1, vec![memfd_for(8, 8)]).unwrap();
        reg.update_placement(1, -5, 40, true).unwrap();

        let view = reg.get(1).unwrap();
        assert!(view.visible);
        assert_eq!(view.geometry, Geometry::new(-5, 40, 8, 8));
    }

    #[test]
    fn test_destroy_semantics() {
        let mut reg = Registry::new(Limits::default());
        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.destroy(1).unwrap();
        assert!(matches!(reg.destroy(1), Err(ControlError::UnknownId(1))));

        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.create(2, dmabuf_desc(1)).unwrap();
        assert_eq!(reg.destroy_all(), 2);
        assert_eq!(reg.destroy_all(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_recreated_id_gets_new_serial() {
        let mut reg = Registry::new(Limits::default());
        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.attach_buffer(1, vec![memfd_for(8, 8)]).unwrap();
        let first = reg.get(1).unwrap().serial;

        reg.destroy(1).unwrap();
        reg.create(1, shm_desc(8, 8)).unwrap();
        reg.attach_buffer(1, vec![memfd_for(8, 8)]).unwrap();
        assert_ne!(reg.get(1).unwrap().serial, first);
    }

    #[test]
    fn test_dmabuf_planes() {
        let mut reg = Registry::new(Limits::default());
        reg.create(4, dmabuf_desc(2)).unwrap();

        // One surplus descriptor is dropped
        let fds = (0..3).map(|_| create_memfd("plane", 16).unwrap()).collect();
        reg.attach_buffer(4, fds).unwrap();

        let view = reg.get(4).unwrap();
        assert!(view.flip);
        match view.content {
            ImageContent::DmaBuf { format, planes, .. } => {
                assert_eq!(format, 0x3432_5258);
                assert_eq!(planes.len(), 2);
                assert_eq!(planes[1].stride, 512);
                assert_eq!(planes[1].offset, 131_072);
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_attach_failures() {
        let mut reg = Registry::new(Limits::default());
        assert!(matches!(
            reg.attach_buffer(1, vec![memfd_for(8, 8)]),
            Err(ControlError::UnknownId(1))
        ));

        reg.create(2, dmabuf_desc(3)).unwrap();
        let fds = (0..2).map(|_| create_memfd("plane", 16).unwrap()).collect();
        assert!(matches!(
            reg.attach_buffer(2, fds),
            Err(ControlError::FdTransferFailed(_))
        ));
        assert!(!reg.is_attached(2));

        // Backing file smaller than the advertised double buffer
        reg.create(3, shm_desc(64, 64)).unwrap();
        let short = create_memfd("short", 64 * 64 * 4).unwrap();
        seal_size(short.as_fd()).unwrap();
        assert!(matches!(
            reg.attach_buffer(3, vec![short]),
            Err(ControlError::MappingFailed { id: 3, .. })
        ));

        reg.create(4, shm_desc(8, 8)).unwrap();
        reg.attach_buffer(4, vec![memfd_for(8, 8)]).unwrap();
        assert!(matches!(
            reg.attach_buffer(4, vec![memfd_for(8, 8)]),
            Err(ControlError::FdTransferFailed(_))
        ));
    }

    #[test]
    fn test_unsealed_buffer_is_rejected() {
        let mut reg = Registry::new(Limits::default());
        reg.create(1, shm_desc(64, 64)).unwrap();

        // A producer could shrink this after we map it
        let unsealed = create_memfd("unsealed", double_buffer_size(64, 64)).unwrap();
        let keep = unsealed.try_clone().unwrap();
        assert!(matches!(
            reg.attach_buffer(1, vec![unsealed]),
            Err(ControlError::MappingFailed { id: 1, .. })
        ));
        assert!(!reg.is_attached(1));
        assert!(reg.snapshot().is_empty());

        // Shrinking the rejected buffer cannot affect the registry
        std::fs::File::from(keep).set_len(0).unwrap();
        assert!(reg.get(1).is_none());

        reg.destroy(1).unwrap();
        reg.create(1, shm_desc(64, 64)).unwrap();
        let sealed = memfd_for(64, 64);
        let file = std::fs::File::from(sealed.try_clone().unwrap());
        reg.attach_buffer(1, vec![sealed]).unwrap();
        reg.commit_contents(1, 1).unwrap();
        assert!(file.set_len(0).is_err());
        assert_eq!(reg.get(1).unwrap().copy_pixels().unwrap().len(), 64 * 64 * 4);
    }

    #[test]
    fn test_copy_pixels() {
        let mut reg = Registry::new(Limits::default());
        let fd = memfd_for(2, 2);
        let mut writer = ShmMapping::map_readwrite(fd.try_clone().unwrap(), 32).unwrap();
        writer.as_mut_slice().unwrap()[16..].fill(0x7f);

        reg.create(2, shm_desc(2, 2)).unwrap();
        reg.attach_buffer(2, vec![fd]).unwrap();
        assert_eq!(reg.get(2).unwrap().copy_pixels(), None);

        reg.commit_contents(2, 1).unwrap();
        let copy = reg.get(2).unwrap().copy_pixels().unwrap();

        // Later writes by the producer do not reach the copy
        writer.as_mut_slice().unwrap()[16..].fill(0);
        assert_eq!(copy, vec![0x7f; 16]);
    }
}
