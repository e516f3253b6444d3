use std::sync::Arc;

use bytes::Bytes;

use super::output::SliceType;
use super::slice_flags::*;
use super::{
    Decode, Encapsulation, EnumType, ExceptionFactoryRegistry, OptionalFormat, OptionalType,
    SliceInfo, SlicedValue, UnknownSlicedValue, UnknownUserException, UserException,
    ValueFactoryRegistry, ValueRef, OPTIONAL_END_MARKER,
};
use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::version::EncodingVersion;

/// Factories and collaborators needed to decode classes, exceptions and
/// proxies.
#[derive(Clone)]
pub struct DecodeContext {
    /// Factories for class type ids.
    pub values: Arc<ValueFactoryRegistry>,
    /// Factories for user exception type ids.
    pub exceptions: Arc<ExceptionFactoryRegistry>,
    /// Needed to turn decoded proxies into usable [`crate::ObjectPrx`]s.
    pub communicator: Option<Communicator>,
    /// Keep unknown slices instead of failing with `NoValueFactory`.
    pub slice_values: bool,
}

impl Default for DecodeContext {
    fn default() -> Self {
        DecodeContext {
            values: Arc::new(ValueFactoryRegistry::default()),
            exceptions: Arc::new(ExceptionFactoryRegistry::default()),
            communicator: None,
            slice_values: true,
        }
    }
}

struct InstanceReader {
    slice_type: SliceType,
    preloaded: bool,
    in_slice: bool,
    flags: u8,
    type_id: String,
    compact_id: Option<i32>,
    data_start: usize,
    slice_size: usize,
    table: Vec<ValueRef>,
    resume_at: Option<usize>,
    skipped: Vec<SliceInfo>,
}

impl InstanceReader {
    fn new(slice_type: SliceType) -> Self {
        InstanceReader {
            slice_type,
            preloaded: false,
            in_slice: false,
            flags: 0,
            type_id: String::new(),
            compact_id: None,
            data_start: 0,
            slice_size: 0,
            table: Vec::new(),
            resume_at: None,
            skipped: Vec::new(),
        }
    }
}

struct ReadEncaps {
    end: usize,
    encoding: EncodingVersion,
    type_ids: Vec<String>,
    // Indexed by instance id - 2; `None` while the instance is being decoded.
    values: Vec<Option<ValueRef>>,
    instances: Vec<InstanceReader>,
}

impl ReadEncaps {
    fn new(end: usize, encoding: EncodingVersion) -> Self {
        ReadEncaps {
            end,
            encoding,
            type_ids: Vec::new(),
            values: Vec::new(),
            instances: Vec::new(),
        }
    }
}

/// Read cursor over an immutable byte buffer.
pub struct InputStream {
    buf: Bytes,
    pos: usize,
    encoding: EncodingVersion,
    root: ReadEncaps,
    nested: Vec<ReadEncaps>,
    context: DecodeContext,
}

impl InputStream {
    /// A stream over `buf` with no factories registered.
    pub fn new(buf: Bytes, encoding: EncodingVersion) -> Self {
        Self::with_context(buf, encoding, DecodeContext::default())
    }

    /// A stream over `buf` decoding with `context`.
    pub fn with_context(buf: Bytes, encoding: EncodingVersion, context: DecodeContext) -> Self {
        let end = buf.len();
        InputStream {
            buf,
            pos: 0,
            encoding,
            root: ReadEncaps::new(end, encoding),
            nested: Vec::new(),
            context,
        }
    }

    /// Factories and limits in use.
    pub fn context(&self) -> &DecodeContext {
        &self.context
    }

    /// The communicator proxies are decoded against, if any.
    pub fn communicator(&self) -> Option<&Communicator> {
        self.context.communicator.as_ref()
    }

    /// Encoding of the data being read.
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    /// Bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor; used to rewind after peeking.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte was consumed.
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// The bytes from the cursor to the end of the buffer.
    pub fn rest(&self) -> Bytes {
        self.buf.slice(self.pos..)
    }

    fn frame(&self) -> &ReadEncaps {
        match self.nested.last() {
            Some(f) => f,
            None => &self.root,
        }
    }

    fn frame_mut(&mut self) -> &mut ReadEncaps {
        match self.nested.last_mut() {
            Some(f) => f,
            None => &mut self.root,
        }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::OutOfBounds {
                needed: n,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    /// Reads a bool.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    /// Reads a byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a 16-bit integer.
    pub fn read_short(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    /// Reads a 32-bit integer.
    pub fn read_int(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Reads a 64-bit integer.
    pub fn read_long(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Reads a 32-bit float.
    pub fn read_float(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Reads a 64-bit float.
    pub fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Reads a compact size; negative extended sizes are marshal errors.
    pub fn read_size(&mut self) -> Result<usize> {
        let b = self.read_byte()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_int()?;
        if v < 0 {
            return Err(Error::marshal(format!("negative size {v}")));
        }
        Ok(v as usize)
    }

    /// Reads a sequence size and checks that `size * min_elem_size` bytes
    /// can still follow.
    pub fn read_and_check_seq_size(&mut self, min_elem_size: usize) -> Result<usize> {
        let size = self.read_size()?;
        let needed = size.saturating_mul(min_elem_size);
        if needed > self.remaining() {
            return Err(Error::OutOfBounds {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(size)
    }

    /// Reads a size-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::marshal(format!("invalid UTF-8 string: {e}")))
    }

    /// Raw bytes of a known length.
    pub fn read_blob(&mut self, len: usize) -> Result<Bytes> {
        self.take(len)
    }

    /// Size-prefixed byte sequence, without copying.
    pub fn read_byte_seq(&mut self) -> Result<Bytes> {
        let len = self.read_size()?;
        self.take(len)
    }

    /// Reads any decodable value.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Reads a sequence of strings.
    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        Vec::<String>::decode(self)
    }

    /// Reads an enumerator, rejecting values the type does not declare.
    pub fn read_enum<E: EnumType>(&mut self) -> Result<E> {
        let value = if self.encoding.is_1_0() {
            if E::MAX_VALUE < 127 {
                i32::from(self.read_byte()?)
            } else if E::MAX_VALUE < 32767 {
                i32::from(self.read_short()?)
            } else {
                self.read_int()?
            }
        } else {
            self.read_size()? as i32
        };
        E::from_value(value).ok_or_else(|| {
            Error::marshal(format!(
                "enumerator value {value} is out of range for {}",
                std::any::type_name::<E>()
            ))
        })
    }

    /// Positions the stream after the tag of optional member `tag` and
    /// returns true, or returns false if the member is absent.
    ///
    /// Lower tags are skipped; a higher tag or the end marker is left
    /// unread. A present member with a different format is an error.
    pub fn read_optional(&mut self, tag: u32, expected: OptionalFormat) -> Result<bool> {
        if self.encoding.is_1_0() {
            return Ok(false);
        }
        if let Some(inst) = self.frame().instances.last() {
            if inst.in_slice && inst.flags & HAS_OPTIONAL_MEMBERS == 0 {
                return Ok(false);
            }
        }
        loop {
            if self.pos >= self.frame().end {
                return Ok(false);
            }
            let start = self.pos;
            let v = self.read_byte()?;
            if v == OPTIONAL_END_MARKER {
                self.pos = start;
                return Ok(false);
            }
            let format = OptionalFormat::from_bits(v);
            let mut read_tag = u32::from(v >> 3);
            if read_tag == 30 {
                read_tag = self.read_size()? as u32;
            }
            if read_tag > tag {
                self.pos = start;
                return Ok(false);
            }
            if read_tag < tag {
                self.skip_optional(format)?;
                continue;
            }
            if format != expected {
                return Err(Error::OptionalFormatMismatch {
                    tag,
                    expected,
                    found: format,
                });
            }
            return Ok(true);
        }
    }

    /// Reads optional member `tag`, if present.
    pub fn read_optional_value<T: OptionalType>(&mut self, tag: u32) -> Result<Option<T>> {
        if self.read_optional(tag, T::OPTIONAL_FORMAT)? {
            Ok(Some(T::decode_optional(self)?))
        } else {
            Ok(None)
        }
    }

    /// Reads optional enumerator `tag`, if present.
    pub fn read_optional_enum<E: EnumType>(&mut self, tag: u32) -> Result<Option<E>> {
        if self.read_optional(tag, OptionalFormat::Size)? {
            Ok(Some(self.read_enum()?))
        } else {
            Ok(None)
        }
    }

    fn skip_optional(&mut self, format: OptionalFormat) -> Result<()> {
        match format {
            OptionalFormat::F1 => self.skip(1),
            OptionalFormat::F2 => self.skip(2),
            OptionalFormat::F4 => self.skip(4),
            OptionalFormat::F8 => self.skip(8),
            OptionalFormat::Size => self.read_size().map(|_| ()),
            OptionalFormat::VSize => {
                let n = self.read_size()?;
                self.skip(n)
            }
            OptionalFormat::FSize => {
                let n = self.read_int()?;
                if n < 0 {
                    return Err(Error::marshal("negative optional size"));
                }
                self.skip(n as usize)
            }
            OptionalFormat::Class => self.read_value().map(|_| ()),
        }
    }

    /// Skips optional members up to the end marker (consumed) or the end of
    /// the current encapsulation.
    fn skip_optionals(&mut self) -> Result<()> {
        loop {
            if self.pos >= self.frame().end {
                return Ok(());
            }
            let v = self.read_byte()?;
            if v == OPTIONAL_END_MARKER {
                return Ok(());
            }
            if v >> 3 == 30 {
                self.read_size()?;
            }
            self.skip_optional(OptionalFormat::from_bits(v))?;
        }
    }

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion)> {
        let start = self.pos;
        let size = self.read_int()?;
        if size < Encapsulation::HEADER_SIZE as i32 {
            return Err(Error::marshal(format!("invalid encapsulation size {size}")));
        }
        let size = size as usize;
        if start + size > self.buf.len() {
            return Err(Error::OutOfBounds {
                needed: size,
                remaining: self.buf.len() - start,
            });
        }
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        Ok((start + size, EncodingVersion::new(major, minor)))
    }

    /// Opens an encapsulation and switches to its encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let (end, encoding) = self.read_encapsulation_header()?;
        if !encoding.is_supported() {
            return Err(Error::UnsupportedEncoding { encoding });
        }
        self.nested.push(ReadEncaps::new(end, encoding));
        self.encoding = encoding;
        Ok(encoding)
    }

    /// Closes the innermost encapsulation, skipping trailing optionals and
    /// checking that its payload was fully consumed.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        if self.nested.is_empty() {
            return Err(Error::marshal("end_encapsulation without an open encapsulation"));
        }
        self.check_consumed()?;
        self.nested.pop();
        self.encoding = self.frame().encoding;
        Ok(())
    }

    fn check_consumed(&mut self) -> Result<()> {
        if !self.encoding.is_1_0() {
            self.skip_optionals()?;
        }
        let end = self.frame().end;
        if self.pos != end {
            return Err(Error::marshal(format!(
                "encapsulation has {} unread bytes",
                end.saturating_sub(self.pos)
            )));
        }
        Ok(())
    }

    /// Checks that a stream opened over an encapsulation payload was fully
    /// consumed.
    pub fn finish(&mut self) -> Result<()> {
        self.check_consumed()
    }

    /// Skips a whole encapsulation and returns its encoding.
    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion> {
        let (end, encoding) = self.read_encapsulation_header()?;
        self.pos = end;
        Ok(encoding)
    }

    /// Reads a whole encapsulation without decoding its payload.
    pub fn read_encapsulation(&mut self) -> Result<Encapsulation> {
        let (end, encoding) = self.read_encapsulation_header()?;
        let data = self.buf.slice(self.pos..end);
        self.pos = end;
        Ok(Encapsulation::new(encoding, data))
    }

    fn current_instance(&mut self) -> Result<&mut InstanceReader> {
        self.frame_mut()
            .instances
            .last_mut()
            .ok_or_else(|| Error::marshal("slice read outside of a value or exception"))
    }

    /// Reads a class instance reference. Shared instances decode to the same
    /// `Arc`; a reference back to an instance still being decoded (a cycle)
    /// is rejected.
    pub fn read_value(&mut self) -> Result<Option<ValueRef>> {
        if self.encoding.is_1_0() {
            return Err(Error::FeatureNotSupported {
                feature: "classes with the 1.0 encoding".to_string(),
            });
        }
        let index = self.read_size()?;
        if index == 0 {
            return Ok(None);
        }
        if let Some(inst) = self.frame().instances.last() {
            if inst.in_slice && inst.flags & HAS_INDIRECTION_TABLE != 0 {
                return inst.table.get(index - 1).cloned().map(Some).ok_or_else(|| {
                    Error::marshal(format!("indirection index {index} out of range"))
                });
            }
        }
        self.read_instance(index).map(Some)
    }

    fn read_instance(&mut self, index: usize) -> Result<ValueRef> {
        if index > 1 {
            return match self.frame().values.get(index - 2) {
                Some(Some(v)) => Ok(v.clone()),
                Some(None) => Err(Error::marshal("cyclic class graphs are not supported")),
                None => Err(Error::marshal(format!("unknown instance id {index}"))),
            };
        }
        let frame = self.frame_mut();
        frame.values.push(None);
        let slot = frame.values.len() - 1;
        frame.instances.push(InstanceReader::new(SliceType::Value));
        let result = self.read_instance_body();
        self.frame_mut().instances.pop();
        let v = result?;
        self.frame_mut().values[slot] = Some(v.clone());
        Ok(v)
    }

    fn read_instance_body(&mut self) -> Result<ValueRef> {
        self.read_slice_header()?;
        let most_derived = self.current_instance()?.type_id.clone();
        loop {
            let type_id = self.current_instance()?.type_id.clone();
            let factory = if type_id.is_empty() {
                None
            } else {
                self.context.values.find(&type_id)
            };
            if let Some(factory) = factory {
                self.current_instance()?.preloaded = true;
                let v = factory(self)?;
                let skipped = std::mem::take(&mut self.current_instance()?.skipped);
                return Ok(if skipped.is_empty() {
                    v
                } else {
                    Arc::new(SlicedValue::new(v, skipped))
                });
            }
            if !self.context.slice_values {
                return Err(Error::NoValueFactory { type_id });
            }
            self.skip_slice()?;
            let inst = self.current_instance()?;
            if inst.flags & IS_LAST_SLICE != 0 {
                let slices = std::mem::take(&mut inst.skipped);
                return Ok(Arc::new(UnknownSlicedValue::new(most_derived, slices)));
            }
            self.read_slice_header()?;
        }
    }

    /// Reads a user exception. Unknown exceptions whose slices can be
    /// skipped decode as [`UnknownUserException`].
    pub fn read_user_exception(&mut self) -> Result<Arc<dyn UserException>> {
        if self.encoding.is_1_0() {
            return Err(Error::FeatureNotSupported {
                feature: "user exceptions with the 1.0 encoding".to_string(),
            });
        }
        self.frame_mut()
            .instances
            .push(InstanceReader::new(SliceType::Exception));
        let result = self.read_exception_body();
        self.frame_mut().instances.pop();
        result
    }

    fn read_exception_body(&mut self) -> Result<Arc<dyn UserException>> {
        self.read_slice_header()?;
        let most_derived = self.current_instance()?.type_id.clone();
        loop {
            let type_id = self.current_instance()?.type_id.clone();
            if let Some(factory) = self.context.exceptions.find(&type_id) {
                self.current_instance()?.preloaded = true;
                return factory(self);
            }
            if self.current_instance()?.flags & HAS_SLICE_SIZE == 0 {
                return Err(Error::UnknownUser {
                    reason: most_derived,
                });
            }
            self.skip_slice()?;
            let inst = self.current_instance()?;
            if inst.flags & IS_LAST_SLICE != 0 {
                let slices = std::mem::take(&mut inst.skipped);
                return Ok(Arc::new(UnknownUserException::new(most_derived, slices)));
            }
            self.read_slice_header()?;
        }
    }

    fn read_type_id(&mut self, is_index: bool) -> Result<String> {
        if is_index {
            let index = self.read_size()?;
            return index
                .checked_sub(1)
                .and_then(|i| self.frame().type_ids.get(i).cloned())
                .ok_or_else(|| Error::marshal(format!("unknown type id index {index}")));
        }
        let type_id = self.read_string()?;
        self.frame_mut().type_ids.push(type_id.clone());
        Ok(type_id)
    }

    fn read_slice_header(&mut self) -> Result<()> {
        let slice_type = self.current_instance()?.slice_type;
        let flags = self.read_byte()?;
        let mut type_id = String::new();
        let mut compact_id = None;
        match slice_type {
            SliceType::Value => {
                if flags & HAS_TYPE_ID_COMPACT == HAS_TYPE_ID_COMPACT {
                    let id = self.read_size()? as i32;
                    compact_id = Some(id);
                    if let Some(resolved) = self.context.values.resolve_compact_id(id) {
                        type_id = resolved;
                    }
                } else if flags & (HAS_TYPE_ID_STRING | HAS_TYPE_ID_INDEX) != 0 {
                    type_id = self.read_type_id(flags & HAS_TYPE_ID_INDEX != 0)?;
                }
            }
            SliceType::Exception => type_id = self.read_string()?,
        }
        let mut slice_size = 0;
        if flags & HAS_SLICE_SIZE != 0 {
            let size = self.read_int()?;
            if size < 4 {
                return Err(Error::marshal(format!("invalid slice size {size}")));
            }
            slice_size = size as usize;
        }
        let data_start = self.pos;
        let mut table = Vec::new();
        let mut resume_at = None;
        if flags & HAS_INDIRECTION_TABLE != 0 {
            if flags & HAS_SLICE_SIZE == 0 {
                return Err(Error::marshal("indirection table without a slice size"));
            }
            // The table follows the slice data; read it first so references
            // in the data resolve to finished instances.
            self.set_pos(data_start);
            self.skip(slice_size - 4)?;
            let count = self.read_and_check_seq_size(1)?;
            for _ in 0..count {
                let index = self.read_size()?;
                if index == 0 {
                    return Err(Error::marshal("null entry in indirection table"));
                }
                table.push(self.read_instance(index)?);
            }
            resume_at = Some(self.pos);
            self.pos = data_start;
        }
        let inst = self.current_instance()?;
        inst.flags = flags;
        inst.type_id = type_id;
        inst.compact_id = compact_id;
        inst.data_start = data_start;
        inst.slice_size = slice_size;
        inst.table = table;
        inst.resume_at = resume_at;
        inst.in_slice = true;
        Ok(())
    }

    fn skip_slice(&mut self) -> Result<()> {
        let (flags, data_start, slice_size) = {
            let inst = self.current_instance()?;
            (inst.flags, inst.data_start, inst.slice_size)
        };
        if flags & HAS_SLICE_SIZE == 0 {
            let type_id = self.current_instance()?.type_id.clone();
            return Err(Error::NoValueFactory { type_id });
        }
        let data_end = data_start + slice_size - 4;
        self.need(data_end.saturating_sub(self.pos))?;
        let has_optional_members = flags & HAS_OPTIONAL_MEMBERS != 0;
        // The optional end marker is written again when the slice is re-encoded.
        let bytes_end = if has_optional_members {
            data_end.saturating_sub(1).max(data_start)
        } else {
            data_end
        };
        let bytes = self.buf.slice(data_start..bytes_end);
        let inst = self.current_instance()?;
        let info = SliceInfo {
            type_id: inst.type_id.clone(),
            compact_id: inst.compact_id,
            bytes,
            instances: std::mem::take(&mut inst.table),
            has_optional_members,
            is_last_slice: flags & IS_LAST_SLICE != 0,
        };
        inst.skipped.push(info);
        inst.in_slice = false;
        let resume = inst.resume_at.take().unwrap_or(data_end);
        self.pos = resume;
        Ok(())
    }

    /// Starts reading one slice. The first slice of an instance handed to a
    /// factory was already read; this returns its type id without moving.
    pub fn start_slice(&mut self) -> Result<String> {
        let inst = self.current_instance()?;
        if inst.preloaded {
            inst.preloaded = false;
            return Ok(inst.type_id.clone());
        }
        self.read_slice_header()?;
        Ok(self.current_instance()?.type_id.clone())
    }

    /// Ends the current slice, skipping unread optional members and the
    /// slice's indirection table.
    pub fn end_slice(&mut self) -> Result<()> {
        let (flags, resume_at) = {
            let inst = self.current_instance()?;
            (inst.flags, inst.resume_at.take())
        };
        if flags & HAS_OPTIONAL_MEMBERS != 0 {
            self.skip_optionals()?;
        }
        if let Some(pos) = resume_at {
            self.pos = pos;
        }
        let inst = self.current_instance()?;
        inst.in_slice = false;
        inst.table.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutputStream;
    use crate::version::{ENCODING_1_0, ENCODING_1_1};

    #[test]
    fn test_out_of_bounds() {
        let mut input = InputStream::new(Bytes::from_static(&[1, 2]), ENCODING_1_1);
        assert!(matches!(
            input.read_int(),
            Err(Error::OutOfBounds {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_negative_size_rejected() {
        let mut input =
            InputStream::new(Bytes::from_static(&[255, 0xFF, 0xFF, 0xFF, 0xFF]), ENCODING_1_1);
        assert!(input.read_size().is_err());
    }

    #[test]
    fn test_optional_skips_lower_and_rewinds_higher() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_optional_value(1, Some(&7i32));
        out.write_optional_value(3, Some(&String::from("three")));
        out.write_optional_value(5, Some(&9i64));
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        assert_eq!(input.read_optional_value::<String>(2).unwrap(), None);
        assert_eq!(
            input.read_optional_value::<String>(3).unwrap(),
            Some(String::from("three"))
        );
        assert_eq!(input.read_optional_value::<i64>(4).unwrap(), None);
        assert_eq!(input.read_optional_value::<i64>(5).unwrap(), Some(9));
        assert_eq!(input.read_optional_value::<i32>(6).unwrap(), None);
        input.finish().unwrap();
    }

    #[test]
    fn test_optional_format_mismatch_is_protocol_error() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_optional_value(1, Some(&7i32));
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        let err = input.read_optional_value::<i64>(1).unwrap_err();
        assert!(matches!(err, Error::OptionalFormatMismatch { tag: 1, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn test_large_tags() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_optional_value(300, Some(&true));
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        assert_eq!(input.read_optional_value::<bool>(300).unwrap(), Some(true));
    }

    #[test]
    fn test_nested_encapsulations() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.start_encapsulation(ENCODING_1_1);
        out.write_string("outer");
        out.start_encapsulation(ENCODING_1_0);
        out.write_short(3);
        out.end_encapsulation();
        out.end_encapsulation();
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_0);
        assert_eq!(input.start_encapsulation().unwrap(), ENCODING_1_1);
        assert_eq!(input.read_string().unwrap(), "outer");
        assert_eq!(input.start_encapsulation().unwrap(), ENCODING_1_0);
        assert_eq!(input.read_short().unwrap(), 3);
        input.end_encapsulation().unwrap();
        input.end_encapsulation().unwrap();
        assert!(input.is_at_end());
    }

    #[test]
    fn test_unread_encapsulation_bytes_rejected() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.start_encapsulation(ENCODING_1_1);
        out.write_int(1);
        out.write_int(2);
        out.end_encapsulation();
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_0);
        input.start_encapsulation().unwrap();
        input.read_int().unwrap();
        assert!(input.end_encapsulation().is_err());
    }

    #[test]
    fn test_unsupported_encapsulation_encoding() {
        let bytes = Bytes::from_static(&[6, 0, 0, 0, 2, 0]);
        let mut input = InputStream::new(bytes, ENCODING_1_0);
        assert!(matches!(
            input.start_encapsulation(),
            Err(Error::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn test_encapsulation_size_beyond_buffer() {
        let bytes = Bytes::from_static(&[60, 0, 0, 0, 1, 1]);
        let mut input = InputStream::new(bytes, ENCODING_1_0);
        assert!(matches!(
            input.read_encapsulation(),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_read_encapsulation_is_zero_copy_slice() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.start_encapsulation(ENCODING_1_1);
        out.write_blob(&[9, 8, 7]);
        out.end_encapsulation();
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_0);
        let encaps = input.read_encapsulation().unwrap();
        assert_eq!(encaps.encoding, ENCODING_1_1);
        assert_eq!(&encaps.data[..], &[9, 8, 7]);
        assert!(input.is_at_end());
    }
}
