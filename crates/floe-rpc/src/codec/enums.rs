use std::fmt;
use std::hash::Hash;

/// An enumeration with a fixed, ordered set of (name, value) pairs.
///
/// Equality and hashing are by value. On the wire, encoding 1.0 uses the
/// smallest fixed-width integer that holds [`EnumType::MAX_VALUE`]; encoding
/// 1.1 uses a compact size. Writing a missing value writes the first declared
/// enumerator, which peers rely on, so it is kept as is.
///
/// Use [`crate::floe_enum!`] to declare one.
pub trait EnumType: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Largest declared value; selects the 1.0 wire width.
    const MAX_VALUE: i32;

    /// Smallest number of bytes an enumerator occupies on the wire.
    const MIN_WIRE_SIZE: usize = 1;

    /// Wire value of the enumerator.
    fn value(self) -> i32;

    /// Declared name of the enumerator.
    fn name(self) -> &'static str;

    /// The enumerator with this value, if declared.
    fn from_value(value: i32) -> Option<Self>;

    /// The first declared enumerator.
    fn first() -> Self;
}

/// Declares an enum and implements [`EnumType`], `Encode`, `Decode`,
/// `OptionalType` and `Display` for it.
///
/// ```
/// floe_rpc::floe_enum! {
///     pub enum Color { Red = 0, Green = 1, Blue = 2 }
/// }
/// ```
#[macro_export]
macro_rules! floe_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $first:ident = $first_value:expr
            $(, $variant:ident = $value:expr)* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $first = $first_value,
            $($variant = $value,)*
        }

        impl $crate::codec::EnumType for $name {
            const MAX_VALUE: i32 = {
                let mut max: i32 = $first_value;
                $(
                    if $value > max {
                        max = $value;
                    }
                )*
                max
            };

            fn value(self) -> i32 {
                self as i32
            }

            fn name(self) -> &'static str {
                match self {
                    $name::$first => stringify!($first),
                    $($name::$variant => stringify!($variant),)*
                }
            }

            fn from_value(value: i32) -> Option<Self> {
                const FIRST: i32 = $first_value;
                if value == FIRST {
                    return Some($name::$first);
                }
                $(
                    if value == $value {
                        return Some($name::$variant);
                    }
                )*
                None
            }

            fn first() -> Self {
                $name::$first
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::codec::EnumType::name(*self))
            }
        }

        impl $crate::codec::Encode for $name {
            fn encode(&self, out: &mut $crate::codec::OutputStream) {
                out.write_enum(Some(*self));
            }
        }

        impl $crate::codec::Decode for $name {
            fn decode(input: &mut $crate::codec::InputStream) -> $crate::Result<Self> {
                input.read_enum()
            }
        }

        impl $crate::codec::OptionalType for $name {
            const OPTIONAL_FORMAT: $crate::codec::OptionalFormat =
                $crate::codec::OptionalFormat::Size;
        }
    };
}
