//! Strict ASCII integer parsing for wire protocols.
//!
//! Rejects a leading `+`, leading zeros, surrounding whitespace, and anything
//! that overflows, matching what the proxied protocols accept.

pub fn parse_int<T: Integer>(bytes: &[u8]) -> Option<T> {
    T::parse(bytes)
}

pub trait Integer: Sized {
    #[doc(hidden)]
    fn parse(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_parse_unsigned {
    ($ty:ty) => {
        impl Integer for $ty {
            fn parse(bytes: &[u8]) -> Option<Self> {
                let [first, rest @ ..] = bytes else {
                    return None;
                };
                if !first.is_ascii_digit() {
                    return None;
                }
                if *first == b'0' {
                    return rest.is_empty().then_some(0);
                }
                let mut value = <$ty>::from(*first - b'0');
                for &c in rest {
                    if !c.is_ascii_digit() {
                        return None;
                    }
                    value = value.checked_mul(10)?.checked_add(<$ty>::from(c - b'0'))?;
                }
                Some(value)
            }
        }
    };
}

impl_parse_unsigned!(u32);
impl_parse_unsigned!(u64);
impl_parse_unsigned!(usize);

macro_rules! impl_parse_signed {
    ($signed:ty, $unsigned:ty) => {
        impl Integer for $signed {
            fn parse(bytes: &[u8]) -> Option<Self> {
                match bytes {
                    [b'-', rest @ ..] => {
                        let magnitude = <$unsigned as Integer>::parse(rest)?;
                        if magnitude > <$signed>::MIN.unsigned_abs() {
                            return None;
                        }
                        Some((magnitude as $signed).wrapping_neg())
                    }
                    _ => {
                        let magnitude = <$unsigned as Integer>::parse(bytes)?;
                        <$signed>::try_from(magnitude).ok()
                    }
                }
            }
        }
    };
}

impl_parse_signed!(i32, u32);
impl_parse_signed!(i64, u64);
