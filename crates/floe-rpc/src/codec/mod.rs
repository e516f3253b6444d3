//! Binary encoding of primitives, sequences, dictionaries, optionals, enums,
//! class graphs and user exceptions.
//!
//! All multi-byte integers are little-endian. Sizes use the compact form: one
//! byte below 255, otherwise `0xFF` followed by an `i32`. Strings are a size
//! followed by UTF-8 bytes. Structs are encoded member by member through the
//! [`Encode`] and [`Decode`] traits; classes and exceptions go through the
//! slice machinery of [`OutputStream`] and [`InputStream`].

mod enums;
mod exception;
mod input;
mod output;
mod value;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use bytes::Bytes;

pub use enums::EnumType;
pub use exception::{
    ExceptionFactory, ExceptionFactoryRegistry, UnknownUserException, UserException,
};
pub use input::{DecodeContext, InputStream};
pub use output::{FormatType, OutputStream};
pub use value::{
    value_downcast, SliceInfo, SlicedValue, UnknownSlicedValue, Value, ValueFactory,
    ValueFactoryRegistry, ValueRef,
};

use crate::error::Result;
use crate::version::EncodingVersion;

/// Request context: a string dictionary sent with every request.
pub type Context = HashMap<String, String>;

/// End marker written after the optional members of a slice.
pub const OPTIONAL_END_MARKER: u8 = 0xFF;

/// Slice flag bits of the 1.1 class and exception encoding.
pub mod slice_flags {
    /// Type id written as a string.
    pub const HAS_TYPE_ID_STRING: u8 = 1;
    /// Type id written as an index into the per-encapsulation table.
    pub const HAS_TYPE_ID_INDEX: u8 = 2;
    /// Type id written as a compact numeric id.
    pub const HAS_TYPE_ID_COMPACT: u8 = 3;
    /// Optional members follow the required ones, ended by `0xFF`.
    pub const HAS_OPTIONAL_MEMBERS: u8 = 4;
    /// An indirection table follows the slice data.
    pub const HAS_INDIRECTION_TABLE: u8 = 8;
    /// An `i32` slice size follows the type id.
    pub const HAS_SLICE_SIZE: u8 = 16;
    /// Base-most slice of the instance.
    pub const IS_LAST_SLICE: u8 = 32;
}

/// Wire format of an optional member, stored in the low three bits of its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalFormat {
    /// One byte.
    F1 = 0,
    /// Two bytes.
    F2 = 1,
    /// Four bytes.
    F4 = 2,
    /// Eight bytes.
    F8 = 3,
    /// A compact size.
    Size = 4,
    /// Variable length data preceded by a compact size.
    VSize = 5,
    /// Data preceded by a fixed `i32` size.
    FSize = 6,
    /// A class instance.
    Class = 7,
}

impl OptionalFormat {
    /// Decodes the low three bits of a tag byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => OptionalFormat::F1,
            1 => OptionalFormat::F2,
            2 => OptionalFormat::F4,
            3 => OptionalFormat::F8,
            4 => OptionalFormat::Size,
            5 => OptionalFormat::VSize,
            6 => OptionalFormat::FSize,
            _ => OptionalFormat::Class,
        }
    }
}

/// A type that can be written to an [`OutputStream`].
pub trait Encode {
    /// Encoded size in bytes when every value of the type has the same size.
    const WIRE_SIZE: Option<usize> = None;

    /// Writes `self` at the end of the stream.
    fn encode(&self, out: &mut OutputStream);
}

/// A type that can be read back from an [`InputStream`].
pub trait Decode: Sized {
    /// Smallest possible encoded size, used to sanity check sequence sizes.
    const MIN_WIRE_SIZE: usize = 1;

    /// Reads a value at the current position.
    fn decode(input: &mut InputStream) -> Result<Self>;
}

/// A type usable as a tagged optional member (encoding 1.1).
pub trait OptionalType: Encode + Decode {
    /// Format recorded in the tag byte.
    const OPTIONAL_FORMAT: OptionalFormat;

    /// Writes the value after its tag.
    fn encode_optional(&self, out: &mut OutputStream) {
        self.encode(out);
    }

    /// Reads the value after its tag.
    fn decode_optional(input: &mut InputStream) -> Result<Self> {
        Self::decode(input)
    }
}

/// A self-contained, versioned, length-delimited payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    /// Encoding of `data`.
    pub encoding: EncodingVersion,
    /// Payload without the six byte header.
    pub data: Bytes,
}

impl Encapsulation {
    /// Size of the `i32` size plus the two version bytes.
    pub const HEADER_SIZE: usize = 6;

    /// Wraps an already encoded payload.
    pub fn new(encoding: EncodingVersion, data: Bytes) -> Self {
        Encapsulation { encoding, data }
    }

    /// An encapsulation with no payload.
    pub fn empty(encoding: EncodingVersion) -> Self {
        Encapsulation {
            encoding,
            data: Bytes::new(),
        }
    }

    /// Size on the wire, header included.
    pub fn wire_size(&self) -> usize {
        self.data.len() + Self::HEADER_SIZE
    }

    /// A reader positioned at the start of the payload.
    pub fn reader(&self, context: DecodeContext) -> InputStream {
        InputStream::with_context(self.data.clone(), self.encoding, context)
    }

    /// Encodes a payload with `write` and wraps it.
    pub fn build<F>(encoding: EncodingVersion, write: F) -> Result<Self>
    where
        F: FnOnce(&mut OutputStream),
    {
        let mut out = OutputStream::new(encoding);
        write(&mut out);
        Ok(Encapsulation::new(encoding, out.finished()?))
    }
}

macro_rules! fixed_primitive {
    ($ty:ty, $size:expr, $format:expr, $write:ident, $read:ident) => {
        impl Encode for $ty {
            const WIRE_SIZE: Option<usize> = Some($size);

            fn encode(&self, out: &mut OutputStream) {
                out.$write(*self);
            }
        }

        impl Decode for $ty {
            const MIN_WIRE_SIZE: usize = $size;

            fn decode(input: &mut InputStream) -> Result<Self> {
                input.$read()
            }
        }

        impl OptionalType for $ty {
            const OPTIONAL_FORMAT: OptionalFormat = $format;
        }
    };
}

fixed_primitive!(bool, 1, OptionalFormat::F1, write_bool, read_bool);
fixed_primitive!(u8, 1, OptionalFormat::F1, write_byte, read_byte);
fixed_primitive!(i16, 2, OptionalFormat::F2, write_short, read_short);
fixed_primitive!(i32, 4, OptionalFormat::F4, write_int, read_int);
fixed_primitive!(i64, 8, OptionalFormat::F8, write_long, read_long);
fixed_primitive!(f32, 4, OptionalFormat::F4, write_float, read_float);
fixed_primitive!(f64, 8, OptionalFormat::F8, write_double, read_double);

impl Encode for String {
    fn encode(&self, out: &mut OutputStream) {
        out.write_string(self);
    }
}

impl Decode for String {
    fn decode(input: &mut InputStream) -> Result<Self> {
        input.read_string()
    }
}

impl OptionalType for String {
    const OPTIONAL_FORMAT: OptionalFormat = OptionalFormat::VSize;
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, out: &mut OutputStream) {
        out.write_size(self.len());
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut InputStream) -> Result<Self> {
        let len = input.read_and_check_seq_size(T::MIN_WIRE_SIZE)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

/// Size written in front of an optional container of fixed-size elements:
/// the element bytes plus the bytes of the element count itself.
fn fixed_container_size(len: usize, elem_size: usize) -> usize {
    len * elem_size + if len > 254 { 5 } else { 1 }
}

impl<T: Encode + Decode> OptionalType for Vec<T> {
    const OPTIONAL_FORMAT: OptionalFormat = match T::WIRE_SIZE {
        Some(_) => OptionalFormat::VSize,
        None => OptionalFormat::FSize,
    };

    fn encode_optional(&self, out: &mut OutputStream) {
        match T::WIRE_SIZE {
            // Byte and bool sequences carry their own size.
            Some(1) => self.encode(out),
            Some(elem) => {
                out.write_size(fixed_container_size(self.len(), elem));
                self.encode(out);
            }
            None => {
                let pos = out.start_size();
                self.encode(out);
                out.end_size(pos);
            }
        }
    }

    fn decode_optional(input: &mut InputStream) -> Result<Self> {
        match T::WIRE_SIZE {
            Some(1) => {}
            Some(_) => {
                input.read_size()?;
            }
            None => {
                input.skip(4)?;
            }
        }
        Self::decode(input)
    }
}

macro_rules! dictionary {
    ($map:ident, $($bound:path),*) => {
        impl<K: Encode, V: Encode> Encode for $map<K, V> {
            fn encode(&self, out: &mut OutputStream) {
                out.write_size(self.len());
                for (k, v) in self {
                    k.encode(out);
                    v.encode(out);
                }
            }
        }

        impl<K: Decode $(+ $bound)*, V: Decode> Decode for $map<K, V> {
            fn decode(input: &mut InputStream) -> Result<Self> {
                let len = input.read_and_check_seq_size(K::MIN_WIRE_SIZE + V::MIN_WIRE_SIZE)?;
                let mut map = $map::new();
                for _ in 0..len {
                    let k = K::decode(input)?;
                    let v = V::decode(input)?;
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        impl<K: Encode + Decode $(+ $bound)*, V: Encode + Decode> OptionalType for $map<K, V> {
            const OPTIONAL_FORMAT: OptionalFormat = match (K::WIRE_SIZE, V::WIRE_SIZE) {
                (Some(_), Some(_)) => OptionalFormat::VSize,
                _ => OptionalFormat::FSize,
            };

            fn encode_optional(&self, out: &mut OutputStream) {
                match (K::WIRE_SIZE, V::WIRE_SIZE) {
                    (Some(k), Some(v)) => {
                        out.write_size(fixed_container_size(self.len(), k + v));
                        self.encode(out);
                    }
                    _ => {
                        let pos = out.start_size();
                        self.encode(out);
                        out.end_size(pos);
                    }
                }
            }

            fn decode_optional(input: &mut InputStream) -> Result<Self> {
                match (K::WIRE_SIZE, V::WIRE_SIZE) {
                    (Some(_), Some(_)) => {
                        input.read_size()?;
                    }
                    _ => {
                        input.skip(4)?;
                    }
                }
                Self::decode(input)
            }
        }
    };
}

dictionary!(HashMap, Eq, Hash);
dictionary!(BTreeMap, Ord);
