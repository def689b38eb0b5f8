use std::ops::{Index, IndexMut, Range};

use half::f16;
use itertools::Itertools;
use strum::{Display, EnumIter, IntoStaticStr};

use crate::{device::DevicePtr, node::Direction};

/// Bytes reserved in front of array and stack payloads for the item count / stack top.
pub const ARRAY_HEADER_BYTES: usize = 16;
/// Fixed geometry of byte-valued lookup tables
pub const LUT_U8_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub usize);

/// Semantic type tag of a data object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ObjectType {
    Scalar,
    Threshold,
    Convolution,
    Array,
    CannyStack,
    Image,
    Tensor,
    Lut,
    Remap,
    Matrix,
    Pyramid,
    ObjectArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LutElem {
    U8,
    I16,
}

impl LutElem {
    pub fn size(&self) -> usize {
        match self {
            LutElem::U8 => 1,
            LutElem::I16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorElem {
    U8,
    I16,
    F16,
    F32,
}

impl TensorElem {
    pub fn size(&self) -> usize {
        match self {
            TensorElem::U8 => 1,
            TensorElem::I16 => 2,
            TensorElem::F16 => std::mem::size_of::<f16>(),
            TensorElem::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataKind {
    Scalar,
    Threshold,
    Convolution,
    Array {
        item_size: usize,
        capacity: usize,
        num_items: usize,
    },
    CannyStack {
        capacity: usize,
        stack_top: u32,
    },
    Image {
        width: u32,
        height: u32,
        stride: usize,
        bytes_per_pixel: usize,
        /// Constant-valued image whose device copy is primed at allocation
        uniform: bool,
    },
    Tensor {
        dims: Vec<usize>,
        elem: TensorElem,
    },
    Lut {
        elem: LutElem,
        count: usize,
    },
    Remap {
        width: u32,
        height: u32,
    },
    Matrix {
        rows: usize,
        cols: usize,
        elem_size: usize,
    },
    Container {
        object_type: ObjectType,
        children: Vec<DataId>,
    },
}

impl DataKind {
    pub fn object_type(&self) -> ObjectType {
        match self {
            DataKind::Scalar => ObjectType::Scalar,
            DataKind::Threshold => ObjectType::Threshold,
            DataKind::Convolution => ObjectType::Convolution,
            DataKind::Array { .. } => ObjectType::Array,
            DataKind::CannyStack { .. } => ObjectType::CannyStack,
            DataKind::Image { .. } => ObjectType::Image,
            DataKind::Tensor { .. } => ObjectType::Tensor,
            DataKind::Lut { .. } => ObjectType::Lut,
            DataKind::Remap { .. } => ObjectType::Remap,
            DataKind::Matrix { .. } => ObjectType::Matrix,
            DataKind::Container { object_type, .. } => *object_type,
        }
    }
}

/// Per-buffer coherence state: dirty reasons plus a synced bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags(u8);

impl SyncFlags {
    /// Written on the host by a CPU node
    pub const DIRTY_BY_NODE: u8 = 0x1;
    /// Written on the device by an accelerator node
    pub const DIRTY_BY_NODE_REMOTE: u8 = 0x2;
    /// Written on the host by the application
    pub const DIRTY_BY_COMMIT: u8 = 0x4;
    /// Pending copy has already been performed
    pub const SYNCED: u8 = 0x8;
    pub const DIRTY_MASK: u8 = 0xf;

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn is_synced(&self) -> bool {
        self.contains(Self::SYNCED)
    }

    pub fn set_synced(&mut self) {
        self.0 |= Self::SYNCED;
    }

    /// Host holds newer data than the device
    pub fn needs_upload(&self) -> bool {
        !self.is_synced() && self.0 & (Self::DIRTY_BY_NODE | Self::DIRTY_BY_COMMIT) != 0
    }

    /// Device holds newer data than the host
    pub fn needs_download(&self) -> bool {
        !self.is_synced() && self.contains(Self::DIRTY_BY_NODE_REMOTE)
    }

    /// Replace every prior reason with `reason`, dropping the synced bit
    pub fn mark(&mut self, reason: u8) {
        self.0 &= !Self::DIRTY_MASK;
        self.0 |= reason;
    }
}

/// Usage counts per parameter direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts(pub [u32; 3]);

impl UsageCounts {
    pub fn add(&mut self, direction: Direction) {
        self.0[direction as usize] += 1;
    }

    pub fn get(&self, direction: Direction) -> u32 {
        self.0[direction as usize]
    }

    pub fn reads(&self) -> bool {
        self.get(Direction::Input) > 0 || self.get(Direction::Bidirectional) > 0
    }

    pub fn writes(&self) -> bool {
        self.get(Direction::Output) > 0 || self.get(Direction::Bidirectional) > 0
    }
}

/// Device allocation exclusively owned by one master buffer.
/// Only the allocator creates it and only [`crate::context::Context::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceMemory {
    ptr: DevicePtr,
    bytes: usize,
}

impl DeviceMemory {
    pub(crate) fn new(ptr: DevicePtr, bytes: usize) -> Self {
        Self { ptr, bytes }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum DeviceBinding {
    #[default]
    None,
    Owned(DeviceMemory),
    /// Memory supplied by the application, never freed here
    Imported(DevicePtr),
    /// Region of a master's allocation
    Alias(DevicePtr),
}

impl DeviceBinding {
    pub fn ptr(&self) -> Option<DevicePtr> {
        match self {
            DeviceBinding::None => None,
            DeviceBinding::Owned(m) => Some(m.ptr()),
            DeviceBinding::Imported(p) | DeviceBinding::Alias(p) => Some(*p),
        }
    }
}

/// Region-of-interest link to the master buffer and the region's shape inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roi {
    pub master: DataId,
    /// Contiguous bytes per run, the innermost extent
    pub run: usize,
    /// `(count, pitch)` of every outer dimension, innermost first
    pub outer: Vec<(usize, usize)>,
}

impl Roi {
    pub fn runs(&self) -> usize {
        self.outer.iter().map(|(count, _)| count).product()
    }

    /// Host mirror ranges of a region starting at `offset`, in row-major order
    pub fn spans(&self, offset: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.runs()).map(move |k| {
            let mut rest = k;
            let start = self.outer.iter().fold(offset, |acc, &(count, pitch)| {
                let i = rest % count;
                rest /= count;
                acc + i * pitch
            });
            start..start + self.run
        })
    }
}

/// One logical data instance tracked by the core
#[derive(Debug)]
pub struct Data {
    pub name: String,
    pub kind: DataKind,
    /// Payload bytes
    pub size: usize,
    /// Bytes preceding the payload in the device allocation
    pub offset: usize,
    pub roi: Option<Roi>,
    pub roi_children: Vec<DataId>,
    pub device: DeviceBinding,
    /// Host mirror laid out as `offset` header bytes followed by the payload
    pub host: Option<Vec<u8>>,
    pub sync: SyncFlags,
    /// Usage across the whole graph
    pub usage: UsageCounts,
    pub is_virtual: bool,
    pub is_delayed: bool,
    pub need_as_argument: bool,
    pub hierarchical_level: u32,
}

impl Data {
    pub fn new(name: impl Into<String>, kind: DataKind, size: usize, offset: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            offset,
            roi: None,
            roi_children: vec![],
            device: DeviceBinding::None,
            host: Some(vec![0; offset + size]),
            sync: SyncFlags::default(),
            usage: UsageCounts::default(),
            is_virtual: false,
            is_delayed: false,
            need_as_argument: false,
            hierarchical_level: 0,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.kind.object_type()
    }

    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.device.ptr()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.host
            .as_deref()
            .and_then(|h| h.get(self.offset..self.offset + self.size))
    }

    /// Payload bytes with the gaps between region rows squeezed out
    pub fn packed_len(&self) -> usize {
        match &self.roi {
            Some(roi) => roi.run * roi.runs(),
            None => self.size,
        }
    }

    /// Host mirror ranges holding the payload. Regions cover one range per row.
    pub fn spans(&self) -> Vec<Range<usize>> {
        match &self.roi {
            Some(roi) => roi.spans(self.offset).collect(),
            None => vec![self.offset..self.offset + self.size],
        }
    }

    pub fn num_items(&self) -> Option<usize> {
        match self.kind {
            DataKind::Array { num_items, .. } => Some(num_items),
            _ => None,
        }
    }

    pub fn virtualized(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn at_level(mut self, level: u32) -> Self {
        self.hierarchical_level = level;
        self
    }
}

/// Ring of data objects whose identities rotate between graph runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    pub slots: Vec<DataId>,
}

/// Owns every data object of a graph. Handles are plain indices.
#[derive(Debug, Default)]
pub struct DataArena {
    data: Vec<Data>,
}

impl Index<DataId> for DataArena {
    type Output = Data;
    fn index(&self, id: DataId) -> &Data {
        &self.data[id.0]
    }
}

impl IndexMut<DataId> for DataArena {
    fn index_mut(&mut self, id: DataId) -> &mut Data {
        &mut self.data[id.0]
    }
}

impl DataArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DataId> {
        (0..self.data.len()).map(DataId)
    }

    pub fn get(&self, id: DataId) -> Option<&Data> {
        self.data.get(id.0)
    }

    pub fn add(&mut self, data: Data) -> DataId {
        self.data.push(data);
        DataId(self.data.len() - 1)
    }

    /// The buffer that owns device memory for `id`
    pub fn master_of(&self, id: DataId) -> DataId {
        self[id].roi.as_ref().map(|r| r.master).unwrap_or(id)
    }

    /// Copy of the payload of `id`, regions packed row after row
    pub fn gather(&self, id: DataId) -> Option<Vec<u8>> {
        let host = self[self.master_of(id)].host.as_deref()?;
        let mut out = Vec::with_capacity(self[id].packed_len());
        for span in self[id].spans() {
            out.extend_from_slice(host.get(span)?);
        }
        Some(out)
    }

    pub fn scalar(&mut self, name: &str, bytes: usize) -> DataId {
        self.add(Data::new(name, DataKind::Scalar, bytes, 0))
    }

    pub fn threshold(&mut self, name: &str) -> DataId {
        self.add(Data::new(name, DataKind::Threshold, 8, 0))
    }

    pub fn convolution(&mut self, name: &str, cols: usize, rows: usize) -> DataId {
        self.add(Data::new(name, DataKind::Convolution, cols * rows * 2, 0))
    }

    pub fn image(&mut self, name: &str, width: u32, height: u32, bytes_per_pixel: usize) -> DataId {
        let stride = width as usize * bytes_per_pixel;
        self.add(Data::new(
            name,
            DataKind::Image {
                width,
                height,
                stride,
                bytes_per_pixel,
                uniform: false,
            },
            stride * height as usize,
            0,
        ))
    }

    /// Single-byte image filled with `value`
    pub fn uniform_image(&mut self, name: &str, width: u32, height: u32, value: u8) -> DataId {
        let id = self.image(name, width, height, 1);
        if let DataKind::Image { uniform, .. } = &mut self[id].kind {
            *uniform = true;
        }
        if let Some(host) = &mut self[id].host {
            host.fill(value);
        }
        id
    }

    /// Rectangular region `(x, y, width, height)` of an image, aliasing its memory.
    /// Regions of regions resolve to the top-level master.
    pub fn image_roi(&mut self, parent: DataId, rect: (u32, u32, u32, u32)) -> Option<DataId> {
        let master = self.master_of(parent);
        let DataKind::Image {
            width,
            height,
            stride,
            bytes_per_pixel: bpp,
            ..
        } = self[parent].kind
        else {
            return None;
        };
        let (x, y, w, h) = rect;
        let outside =
            |start: u32, len: u32, limit: u32| start.checked_add(len).map_or(true, |e| e > limit);
        if w == 0 || h == 0 || outside(x, w, width) || outside(y, h, height) {
            return None;
        }
        let offset = self[parent].offset + y as usize * stride + x as usize * bpp;
        let size = (h as usize - 1) * stride + w as usize * bpp;
        let mut data = Data::new(
            format!("{}[{x},{y},{w},{h}]", self[parent].name),
            DataKind::Image {
                width: w,
                height: h,
                stride,
                bytes_per_pixel: bpp,
                uniform: false,
            },
            size,
            offset,
        );
        data.host = None;
        data.roi = Some(Roi {
            master,
            run: w as usize * bpp,
            outer: vec![(h as usize, stride)],
        });
        data.is_virtual = self[master].is_virtual;
        let id = self.add(data);
        self[master].roi_children.push(id);
        Some(id)
    }

    pub fn array(&mut self, name: &str, item_size: usize, capacity: usize) -> DataId {
        self.add(Data::new(
            name,
            DataKind::Array {
                item_size,
                capacity,
                num_items: 0,
            },
            item_size * capacity,
            ARRAY_HEADER_BYTES,
        ))
    }

    /// Internal stack used by edge tracing kernels, stack entries are 4 bytes
    pub fn canny_stack(&mut self, name: &str, capacity: usize) -> DataId {
        self.add(Data::new(
            name,
            DataKind::CannyStack {
                capacity,
                stack_top: 0,
            },
            capacity * 4,
            ARRAY_HEADER_BYTES,
        ))
    }

    pub fn tensor(&mut self, name: &str, dims: &[usize], elem: TensorElem) -> DataId {
        let size = dims.iter().product::<usize>() * elem.size();
        self.add(Data::new(
            name,
            DataKind::Tensor {
                dims: dims.to_vec(),
                elem,
            },
            size,
            0,
        ))
    }

    /// View `[start, end)` of a tensor. `dims[0]` is the innermost dimension.
    pub fn tensor_roi(&mut self, parent: DataId, start: &[usize], end: &[usize]) -> Option<DataId> {
        let master = self.master_of(parent);
        let DataKind::Tensor { dims, elem } = self[parent].kind.clone() else {
            return None;
        };
        if start.len() != dims.len()
            || end.len() != dims.len()
            || start.iter().zip(end).zip(&dims).any(|((s, e), d)| s >= e || e > d)
        {
            return None;
        }
        // Pitches come from the master so views of views stay in its layout
        let DataKind::Tensor { dims: master_dims, .. } = &self[master].kind else {
            return None;
        };
        let strides = master_dims
            .iter()
            .scan(elem.size(), |acc, d| {
                let s = *acc;
                *acc *= d;
                Some(s)
            })
            .collect_vec();
        let first = start.iter().zip(&strides).map(|(s, st)| s * st).sum::<usize>();
        let last = end.iter().zip(&strides).map(|(e, st)| (e - 1) * st).sum::<usize>();
        let mut data = Data::new(
            format!("{}[{start:?}..{end:?}]", self[parent].name),
            DataKind::Tensor {
                dims: start.iter().zip(end).map(|(s, e)| e - s).collect(),
                elem,
            },
            last + elem.size() - first,
            self[parent].offset + first,
        );
        data.host = None;
        data.roi = Some(Roi {
            master,
            run: (end[0] - start[0]) * elem.size(),
            outer: start
                .iter()
                .zip(end)
                .zip(&strides)
                .skip(1)
                .map(|((s, e), pitch)| (e - s, *pitch))
                .collect(),
        });
        data.is_virtual = self[master].is_virtual;
        let id = self.add(data);
        self[master].roi_children.push(id);
        Some(id)
    }

    pub fn lut(&mut self, name: &str, elem: LutElem, count: usize) -> DataId {
        let count = match elem {
            LutElem::U8 => LUT_U8_ENTRIES,
            LutElem::I16 => count,
        };
        self.add(Data::new(
            name,
            DataKind::Lut { elem, count },
            count * elem.size(),
            0,
        ))
    }

    /// Remap table of one (x, y) f32 coordinate pair per destination pixel
    pub fn remap(&mut self, name: &str, width: u32, height: u32) -> DataId {
        self.add(Data::new(
            name,
            DataKind::Remap { width, height },
            width as usize * height as usize * 8,
            0,
        ))
    }

    pub fn matrix(&mut self, name: &str, rows: usize, cols: usize, elem_size: usize) -> DataId {
        self.add(Data::new(
            name,
            DataKind::Matrix {
                rows,
                cols,
                elem_size,
            },
            rows * cols * elem_size,
            0,
        ))
    }

    /// Pyramid or object array grouping existing objects
    pub fn container(&mut self, name: &str, object_type: ObjectType, children: Vec<DataId>) -> DataId {
        let mut data = Data::new(
            name,
            DataKind::Container {
                object_type,
                children,
            },
            0,
            0,
        );
        data.host = None;
        self.add(data)
    }

    /// Tie data objects into a delay ring
    pub fn delay(&mut self, slots: Vec<DataId>) -> Delay {
        for id in &slots {
            self[*id].is_delayed = true;
        }
        Delay { slots }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_sync_flags() {
        let mut flags = SyncFlags::default();
        assert!(!flags.needs_upload());
        flags.mark(SyncFlags::DIRTY_BY_COMMIT);
        assert!(flags.needs_upload());
        flags.set_synced();
        assert!(!flags.needs_upload());
        flags.mark(SyncFlags::DIRTY_BY_NODE_REMOTE);
        assert!(!flags.is_synced());
        assert!(!flags.needs_upload());
        assert!(flags.needs_download());
        assert_eq!(flags.bits(), SyncFlags::DIRTY_BY_NODE_REMOTE);
    }

    #[test]
    fn test_image_roi_offsets() {
        let mut arena = DataArena::new();
        let img = arena.image("img", 16, 8, 2);
        let roi = arena.image_roi(img, (2, 3, 4, 2)).unwrap();
        assert_eq!(arena[roi].offset, 3 * 32 + 2 * 2);
        assert_eq!(arena[roi].size, 32 + 8);
        assert_eq!(arena.master_of(roi), img);
        assert_eq!(arena[img].roi_children, vec![roi]);
        assert!(arena[roi].host.is_none());

        // Nested regions point at the top-level master
        let inner = arena.image_roi(roi, (1, 1, 2, 1)).unwrap();
        assert_eq!(arena.master_of(inner), img);
        assert_eq!(arena[inner].offset, arena[roi].offset + 32 + 2);
        assert!(arena.image_roi(img, (10, 0, 8, 1)).is_none());
        assert!(arena.image_roi(img, (u32::MAX, 0, 2, 1)).is_none());
        assert!(arena.image_roi(img, (0, 1, 1, u32::MAX)).is_none());
    }

    #[test]
    fn test_region_spans() {
        let mut arena = DataArena::new();
        let img = arena.image("img", 8, 4, 1);
        let roi = arena.image_roi(img, (2, 1, 4, 2)).unwrap();
        assert_eq!(arena[roi].packed_len(), 8);
        assert_eq!(arena[roi].spans(), vec![10..14, 18..22]);
        assert_eq!(arena[img].spans(), vec![0..32]);

        if let Some(host) = arena[img].host.as_mut() {
            for (i, b) in host.iter_mut().enumerate() {
                *b = i as u8;
            }
        }
        assert_eq!(arena.gather(roi).unwrap(), vec![10, 11, 12, 13, 18, 19, 20, 21]);
    }

    #[test]
    fn test_tensor_roi_offsets() {
        let mut arena = DataArena::new();
        let t = arena.tensor("t", &[4, 3, 2], TensorElem::F16);
        assert_eq!(arena[t].size, 48);
        let roi = arena.tensor_roi(t, &[1, 0, 1], &[3, 2, 2]).unwrap();
        // strides 2, 8, 24
        assert_eq!(arena[roi].offset, 2 + 24);
        assert_eq!(arena[roi].size, (2 * 2 + 8 + 24) + 2 - 26);
        assert!(arena.tensor_roi(t, &[0, 0, 0], &[5, 1, 1]).is_none());
        // Runs of 2 elements over 2 rows, one plane
        assert_eq!(arena[roi].packed_len(), 2 * 2 * 2);
        assert_eq!(arena[roi].spans(), vec![26..30, 34..38]);

        // A view of the view keeps the master's pitches
        let inner = arena.tensor_roi(roi, &[1, 1, 0], &[2, 2, 1]).unwrap();
        assert_eq!(arena.master_of(inner), t);
        assert_eq!(arena[inner].offset, 26 + 2 + 8);
        assert_eq!(arena[inner].spans(), vec![36..38]);
    }

    #[test]
    fn test_object_type_names() {
        let mut arena = DataArena::new();
        let a = arena.array("a", 4, 10);
        assert_eq!(arena[a].object_type().to_string(), "array");
        assert_eq!(arena[a].offset, ARRAY_HEADER_BYTES);
        assert_eq!(arena[a].host.as_ref().unwrap().len(), ARRAY_HEADER_BYTES + 40);
        let l = arena.lut("l", LutElem::U8, 3);
        assert_eq!(arena[l].size, LUT_U8_ENTRIES);
        assert_eq!(ObjectType::CannyStack.to_string(), "canny_stack");
        let names: Vec<&'static str> = ObjectType::iter().map(Into::into).collect();
        assert_eq!(names.len(), 12);
        assert!(names.contains(&"object_array"));
    }
}
