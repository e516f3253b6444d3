use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::slice_flags::*;
use super::{
    EnumType, Encapsulation, Encode, OptionalFormat, OptionalType, SliceInfo, UserException,
    ValueRef, OPTIONAL_END_MARKER,
};
use crate::error::{Error, Result};
use crate::version::EncodingVersion;

/// Class and exception slice layout used when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatType {
    /// Type id only on the first slice, no slice sizes; receivers must know
    /// every type.
    Compact,
    /// Every slice carries its type id and size so receivers can skip unknown
    /// slices.
    #[default]
    Sliced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceType {
    Value,
    Exception,
}

struct InstanceWriter {
    slice_type: SliceType,
    first_slice: bool,
    in_slice: bool,
    flags: u8,
    flags_pos: usize,
    size_pos: usize,
    table: Vec<ValueRef>,
    table_index: HashMap<usize, usize>,
}

impl InstanceWriter {
    fn new(slice_type: SliceType) -> Self {
        InstanceWriter {
            slice_type,
            first_slice: true,
            in_slice: false,
            flags: 0,
            flags_pos: 0,
            size_pos: 0,
            table: Vec::new(),
            table_index: HashMap::new(),
        }
    }
}

/// Per-encapsulation class state: instance ids and type id indices are only
/// meaningful inside the encapsulation that assigned them.
struct WriteEncaps {
    start: usize,
    encoding: EncodingVersion,
    marshaled: HashMap<usize, usize>,
    retained: Vec<ValueRef>,
    next_value_id: usize,
    type_ids: HashMap<String, usize>,
    instances: Vec<InstanceWriter>,
}

impl WriteEncaps {
    fn new(start: usize, encoding: EncodingVersion) -> Self {
        WriteEncaps {
            start,
            encoding,
            marshaled: HashMap::new(),
            retained: Vec::new(),
            // Instance ids start at 2; 0 is null and 1 is the inline marker.
            next_value_id: 1,
            type_ids: HashMap::new(),
            instances: Vec::new(),
        }
    }
}

fn value_key(v: &ValueRef) -> usize {
    Arc::as_ptr(v) as *const () as usize
}

/// Growable buffer with a write cursor at its end.
///
/// Writes never fail individually. Misuse that cannot be expressed on the
/// wire (classes under encoding 1.0, slices outside an instance) is recorded
/// and reported by [`OutputStream::finished`].
pub struct OutputStream {
    buf: BytesMut,
    encoding: EncodingVersion,
    format: FormatType,
    root: WriteEncaps,
    nested: Vec<WriteEncaps>,
    error: Option<Error>,
}

impl OutputStream {
    /// Creates an empty stream writing in `encoding`.
    pub fn new(encoding: EncodingVersion) -> Self {
        OutputStream {
            buf: BytesMut::with_capacity(256),
            encoding,
            format: FormatType::default(),
            root: WriteEncaps::new(0, encoding),
            nested: Vec::new(),
            error: None,
        }
    }

    /// Current encoding (the innermost open encapsulation's).
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    /// Selects compact or sliced class layout.
    pub fn set_format(&mut self, format: FormatType) {
        self.format = format;
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Records a failure; the first one wins.
    pub fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Returns the encoded bytes, or the first recorded failure.
    pub fn finished(self) -> Result<Bytes> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf.freeze()),
        }
    }

    fn frame(&self) -> &WriteEncaps {
        match self.nested.last() {
            Some(f) => f,
            None => &self.root,
        }
    }

    fn frame_mut(&mut self) -> &mut WriteEncaps {
        match self.nested.last_mut() {
            Some(f) => f,
            None => &mut self.root,
        }
    }

    /// Writes a bool.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Writes a byte.
    pub fn write_byte(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a 16-bit integer.
    pub fn write_short(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    /// Writes a 32-bit integer.
    pub fn write_int(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// Writes a 64-bit integer.
    pub fn write_long(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Writes a 32-bit float.
    pub fn write_float(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// Writes a 64-bit float.
    pub fn write_double(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Writes a compact size: one byte below 255, else `0xFF` and an `i32`.
    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size as i32);
        }
    }

    /// Writes a size-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) {
        self.write_size(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    /// Raw bytes, no size prefix.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Size-prefixed byte sequence.
    pub fn write_byte_seq(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// Writes any encodable value.
    pub fn write<T: Encode + ?Sized>(&mut self, v: &T) {
        v.encode(self);
    }

    /// Writes a size-prefixed sequence.
    pub fn write_seq<T: Encode>(&mut self, items: &[T]) {
        self.write_size(items.len());
        for item in items {
            item.encode(self);
        }
    }

    /// Writes a sequence of strings.
    pub fn write_string_seq(&mut self, items: &[String]) {
        self.write_seq(items);
    }

    /// Overwrites an `i32` already written at `pos`.
    pub fn rewrite_int(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Reserves an `i32` size; pair with [`OutputStream::end_size`].
    pub fn start_size(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.put_i32_le(0);
        pos
    }

    /// Fills in the size reserved at `pos` with the bytes written after it.
    pub fn end_size(&mut self, pos: usize) {
        let size = self.buf.len() - pos - 4;
        self.rewrite_int(pos, size as i32);
    }

    /// Writes the tag of an optional member. Returns false (and writes
    /// nothing) under encoding 1.0, where optionals do not exist.
    pub fn write_optional(&mut self, tag: u32, format: OptionalFormat) -> bool {
        if self.encoding.is_1_0() {
            return false;
        }
        let format_bits = format as u8;
        if tag < 30 {
            self.buf.put_u8(format_bits | ((tag as u8) << 3));
        } else {
            self.buf.put_u8(format_bits | (30 << 3));
            self.write_size(tag as usize);
        }
        if let Some(inst) = self.frame_mut().instances.last_mut() {
            if inst.in_slice {
                inst.flags |= HAS_OPTIONAL_MEMBERS;
            }
        }
        true
    }

    /// Writes an optional member if present.
    pub fn write_optional_value<T: OptionalType>(&mut self, tag: u32, v: Option<&T>) {
        if let Some(v) = v {
            if self.write_optional(tag, T::OPTIONAL_FORMAT) {
                v.encode_optional(self);
            }
        }
    }

    /// Writes an enumerator. A missing value is written as the type's first
    /// declared enumerator.
    pub fn write_enum<E: EnumType>(&mut self, v: Option<E>) {
        let value = v.unwrap_or_else(E::first).value();
        if self.encoding.is_1_0() {
            if E::MAX_VALUE < 127 {
                self.write_byte(value as u8);
            } else if E::MAX_VALUE < 32767 {
                self.write_short(value as i16);
            } else {
                self.write_int(value);
            }
        } else {
            self.write_size(value as usize);
        }
    }

    /// Writes an optional enum member. As with [`OutputStream::write_enum`],
    /// `None` is encoded as the first declared enumerator rather than being
    /// left out.
    pub fn write_optional_enum<E: EnumType>(&mut self, tag: u32, v: Option<E>) {
        if self.write_optional(tag, OptionalFormat::Size) {
            self.write_enum(v);
        }
    }

    /// Opens an encapsulation; class state restarts inside it.
    pub fn start_encapsulation(&mut self, encoding: EncodingVersion) {
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.nested.push(WriteEncaps::new(start, encoding));
        self.encoding = encoding;
    }

    /// Closes the innermost encapsulation and patches its size.
    pub fn end_encapsulation(&mut self) {
        match self.nested.pop() {
            Some(encaps) => {
                let size = self.buf.len() - encaps.start;
                self.rewrite_int(encaps.start, size as i32);
                self.encoding = self.frame().encoding;
            }
            None => self.fail(Error::marshal("end_encapsulation without an open encapsulation")),
        }
    }

    /// Copies a whole encapsulation, header included.
    pub fn write_encapsulation(&mut self, encaps: &Encapsulation) {
        self.buf.put_i32_le(encaps.wire_size() as i32);
        self.buf.put_u8(encaps.encoding.major);
        self.buf.put_u8(encaps.encoding.minor);
        self.buf.put_slice(&encaps.data);
    }

    /// Writes an encapsulation with no payload.
    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.write_encapsulation(&Encapsulation::empty(encoding));
    }

    /// Writes a class instance reference, marshaling the instance the first
    /// time it is seen in this encapsulation.
    pub fn write_value(&mut self, v: Option<&ValueRef>) {
        if self.encoding.is_1_0() {
            self.fail(Error::FeatureNotSupported {
                feature: "classes with the 1.0 encoding".to_string(),
            });
            return;
        }
        let Some(v) = v else {
            self.write_size(0);
            return;
        };
        if self.format == FormatType::Sliced {
            if let Some(inst) = self.frame_mut().instances.last_mut() {
                if inst.in_slice {
                    // Inside a sliced-format slice, instances are referenced
                    // through the slice's indirection table (1-based).
                    let key = value_key(v);
                    let index = match inst.table_index.get(&key) {
                        Some(index) => *index,
                        None => {
                            inst.table.push(v.clone());
                            let index = inst.table.len();
                            inst.table_index.insert(key, index);
                            index
                        }
                    };
                    self.write_size(index);
                    return;
                }
            }
        }
        self.write_instance(v);
    }

    fn write_instance(&mut self, v: &ValueRef) {
        let key = value_key(v);
        let frame = self.frame_mut();
        if let Some(id) = frame.marshaled.get(&key) {
            let id = *id;
            self.write_size(id);
            return;
        }
        frame.next_value_id += 1;
        let id = frame.next_value_id;
        frame.marshaled.insert(key, id);
        frame.retained.push(v.clone());
        frame.instances.push(InstanceWriter::new(SliceType::Value));
        self.write_size(1);
        v.write_slices(self);
        self.frame_mut().instances.pop();
    }

    /// Writes a user exception as a chain of slices (encoding 1.1 only).
    pub fn write_user_exception(&mut self, e: &dyn UserException) {
        if self.encoding.is_1_0() {
            self.fail(Error::FeatureNotSupported {
                feature: "user exceptions with the 1.0 encoding".to_string(),
            });
            return;
        }
        self.frame_mut()
            .instances
            .push(InstanceWriter::new(SliceType::Exception));
        e.write_slices(self);
        self.frame_mut().instances.pop();
    }

    fn register_type_id(&mut self, type_id: &str) -> Option<usize> {
        let frame = self.frame_mut();
        if let Some(index) = frame.type_ids.get(type_id) {
            return Some(*index);
        }
        let index = frame.type_ids.len() + 1;
        frame.type_ids.insert(type_id.to_string(), index);
        None
    }

    /// Starts one slice of the value or exception being written.
    pub fn start_slice(&mut self, type_id: &str, compact_id: Option<i32>, last: bool) {
        let sliced = self.format == FormatType::Sliced;
        let (slice_type, first) = match self.frame().instances.last() {
            Some(inst) => (inst.slice_type, inst.first_slice),
            None => {
                self.fail(Error::marshal("slice written outside of a value or exception"));
                return;
            }
        };
        let flags_pos = self.buf.len();
        self.buf.put_u8(0);
        let mut flags = 0u8;
        if sliced {
            flags |= HAS_SLICE_SIZE;
        }
        if last {
            flags |= IS_LAST_SLICE;
        }
        match slice_type {
            SliceType::Value => {
                if sliced || first {
                    if let Some(compact_id) = compact_id {
                        flags |= HAS_TYPE_ID_COMPACT;
                        self.write_size(compact_id as usize);
                    } else if let Some(index) = self.register_type_id(type_id) {
                        flags |= HAS_TYPE_ID_INDEX;
                        self.write_size(index);
                    } else {
                        flags |= HAS_TYPE_ID_STRING;
                        self.write_string(type_id);
                    }
                }
            }
            SliceType::Exception => self.write_string(type_id),
        }
        let size_pos = self.buf.len();
        if sliced {
            self.buf.put_i32_le(0);
        }
        if let Some(inst) = self.frame_mut().instances.last_mut() {
            inst.flags = flags;
            inst.flags_pos = flags_pos;
            inst.size_pos = size_pos;
            inst.first_slice = false;
            inst.in_slice = true;
        }
    }

    /// Ends the current slice: optional end marker, slice size, indirection
    /// table, then the final flag byte.
    pub fn end_slice(&mut self) {
        let (mut flags, flags_pos, size_pos, table) = match self.frame_mut().instances.last_mut() {
            Some(inst) if inst.in_slice => {
                inst.in_slice = false;
                inst.table_index.clear();
                (
                    inst.flags,
                    inst.flags_pos,
                    inst.size_pos,
                    std::mem::take(&mut inst.table),
                )
            }
            _ => {
                self.fail(Error::marshal("end_slice without a matching start_slice"));
                return;
            }
        };
        if flags & HAS_OPTIONAL_MEMBERS != 0 {
            self.buf.put_u8(OPTIONAL_END_MARKER);
        }
        if flags & HAS_SLICE_SIZE != 0 {
            let size = self.buf.len() - size_pos;
            self.rewrite_int(size_pos, size as i32);
        }
        if !table.is_empty() {
            flags |= HAS_INDIRECTION_TABLE;
            self.write_size(table.len());
            for v in &table {
                self.write_instance(v);
            }
        }
        self.buf[flags_pos] = flags;
    }

    /// Re-writes slices preserved from a decoded instance of a type this
    /// process does not know. Dropped under the compact format.
    pub fn write_preserved_slices(&mut self, slices: &[SliceInfo]) {
        if self.format != FormatType::Sliced {
            return;
        }
        for slice in slices {
            self.start_slice(&slice.type_id, slice.compact_id, slice.is_last_slice);
            self.write_blob(&slice.bytes);
            if let Some(inst) = self.frame_mut().instances.last_mut() {
                if slice.has_optional_members {
                    inst.flags |= HAS_OPTIONAL_MEMBERS;
                }
                inst.table.extend(slice.instances.iter().cloned());
            }
            self.end_slice();
        }
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        OutputStream::new(EncodingVersion::default())
    }
}
