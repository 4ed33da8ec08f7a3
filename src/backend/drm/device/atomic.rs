use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd};

use super::{KmsDevice, ObjectId};
use crate::backend::drm::error::AccessError;

bitflags::bitflags! {
    /// Flags of `DRM_IOCTL_MODE_ATOMIC`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtomicCommitFlags: u32 {
        /// Generate a page-flip event once the commit is applied
        const PAGE_FLIP_EVENT = 0x01;
        /// Only check the request
        const TEST_ONLY = 0x0100;
        /// Return before the commit is applied
        const NONBLOCK = 0x0200;
        /// Allow the commit to change modes
        const ALLOW_MODESET = 0x0400;
    }
}

/// The four parallel arrays of an atomic commit.
///
/// Objects are appended with [`begin_object`](AtomicRequest::begin_object), each followed by
/// its properties. The storage is kept across [`clear`](AtomicRequest::clear), so a request
/// reused every frame stops allocating once it saw its largest commit.
#[derive(Debug)]
pub struct AtomicRequest {
    objects: Vec<u32>,
    count_props: Vec<u32>,
    props: Vec<u32>,
    values: Vec<u64>,
    // boxed so its address stays valid while the request moves
    out_fence: Box<i32>,
}

impl Default for AtomicRequest {
    fn default() -> Self {
        AtomicRequest::new()
    }
}

impl AtomicRequest {
    /// An empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest {
            objects: Vec::new(),
            count_props: Vec::new(),
            props: Vec::new(),
            values: Vec::new(),
            out_fence: Box::new(-1),
        }
    }

    /// Drop all objects and properties, keeping the allocations.
    ///
    /// A fence still stored in the out-fence slot is closed.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.count_props.clear();
        self.props.clear();
        self.values.clear();
        drop(self.take_out_fence());
    }

    /// Make room for `objects` objects with `props` properties in total
    pub fn reserve(&mut self, objects: usize, props: usize) {
        self.objects.reserve(objects.saturating_sub(self.objects.len()));
        self.count_props
            .reserve(objects.saturating_sub(self.count_props.len()));
        self.props.reserve(props.saturating_sub(self.props.len()));
        self.values.reserve(props.saturating_sub(self.values.len()));
    }

    /// Start the property block of `object`
    pub fn begin_object(&mut self, object: u32) {
        self.objects.push(object);
        self.count_props.push(0);
    }

    /// Append a property to the current object.
    ///
    /// Calling this before [`begin_object`](AtomicRequest::begin_object) is a logic error
    /// and the property is dropped.
    pub fn push(&mut self, prop: u32, value: u64) {
        if let Some(count) = self.count_props.last_mut() {
            *count += 1;
            self.props.push(prop);
            self.values.push(value);
        }
    }

    /// Number of objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of properties over all objects
    pub fn property_count(&self) -> usize {
        self.props.len()
    }

    /// Iterate `(object, property ids, values)` blocks
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32], &[u64])> + '_ {
        let (props, values) = (&self.props, &self.values);
        let mut start = 0;
        self.objects
            .iter()
            .zip(self.count_props.iter())
            .map(move |(&object, &count)| {
                let range = start..start + count as usize;
                start = range.end;
                (object, &props[range.clone()], &values[range])
            })
    }

    /// Value assigned to `prop` of `object`
    pub fn value(&self, object: u32, prop: u32) -> Option<u64> {
        self.iter()
            .filter(|(obj, _, _)| *obj == object)
            .find_map(|(_, props, values)| props.iter().position(|&p| p == prop).map(|i| values[i]))
    }

    /// Property block of `object`
    pub fn object(&self, object: u32) -> Option<(&[u32], &[u64])> {
        self.iter()
            .find(|(obj, _, _)| *obj == object)
            .map(|(_, props, values)| (props, values))
    }

    /// Address the driver writes the writeback fence to, as a property value
    pub fn out_fence_ptr(&mut self) -> u64 {
        &mut *self.out_fence as *mut i32 as u64
    }

    /// Whether a fence was stored in the out-fence slot
    pub fn has_out_fence(&self) -> bool {
        *self.out_fence >= 0
    }

    /// Take ownership of the fence the driver stored, resetting the slot to -1
    pub fn take_out_fence(&mut self) -> Option<OwnedFd> {
        let fd = std::mem::replace(&mut *self.out_fence, -1);
        // SAFETY: a non-negative value was installed by the kernel (or `store_out_fence`)
        // for this request and nobody else owns it.
        (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Store a fence in the out-fence slot, as the kernel does on commit
    pub fn store_out_fence(&mut self, fence: OwnedFd) {
        drop(self.take_out_fence());
        *self.out_fence = fence.into_raw_fd();
    }

    #[cfg(feature = "backend_drm")]
    pub(crate) fn raw_arrays(&mut self) -> (&mut [u32], &mut [u32], &mut [u32], &mut [u64]) {
        (
            self.objects.as_mut_slice(),
            self.count_props.as_mut_slice(),
            self.props.as_mut_slice(),
            self.values.as_mut_slice(),
        )
    }
}

impl Drop for AtomicRequest {
    fn drop(&mut self) {
        drop(self.take_out_fence());
    }
}

/// A property of a mode-object with its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEntry {
    /// Property id
    pub id: u32,
    /// Property name as reported by the driver
    pub name: String,
    /// Value at the time of the query
    pub value: u64,
    /// Whether the property is read-only
    pub immutable: bool,
}

/// Properties of one mode-object, in driver order.
///
/// Names are not deduplicated: drivers occasionally report a property twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    object: Option<ObjectId>,
    entries: Vec<PropertyEntry>,
}

impl PropertyMap {
    /// Query all properties of `object`.
    ///
    /// Properties whose metadata cannot be read are skipped.
    pub fn read(device: &dyn KmsDevice, object: ObjectId) -> Result<PropertyMap, AccessError> {
        let props = device.properties(object).map_err(|source| AccessError {
            errmsg: "Error reading properties",
            dev: device.dev_path(),
            source,
        })?;
        let entries = props
            .into_iter()
            .filter_map(|(id, value)| {
                let info = device.property(id).ok()?;
                Some(PropertyEntry {
                    id,
                    name: info.name,
                    value,
                    immutable: info.immutable,
                })
            })
            .collect();
        Ok(PropertyMap {
            object: Some(object),
            entries,
        })
    }

    /// The object these properties belong to
    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    /// First property called `name`
    pub fn get(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All properties in driver order
    pub fn iter(&self) -> impl Iterator<Item = &PropertyEntry> {
        self.entries.iter()
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the object has no properties
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
