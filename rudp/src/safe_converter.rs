/// For widening casts that can never lose information on the supported platforms
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range,
///  e.g. slab indices (bounded by the slab's capacity) or the number of packets in a message
///  (bounded by the validated maximum message size).
///
/// NB: Out-of-range values are a bug, and they are caught by a debug assertion
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        debug_assert!(self <= u32::MAX as usize, "this is a bug: application logic should have ensured the value range");
        self as u32
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        debug_assert!(self <= u16::MAX as usize, "this is a bug: application logic should have ensured the value range");
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::max(u16::MAX as usize, u16::MAX)]
    fn test_prechecked_u16(#[case] value: usize, #[case] expected: u16) {
        let actual: u16 = value.prechecked_cast();
        assert_eq!(actual, expected);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = (u16::MAX as usize + 1).prechecked_cast();
    }

    #[test]
    fn test_safe_cast() {
        let a: usize = u32::MAX.safe_cast();
        let b: usize = 7u16.safe_cast();
        assert_eq!(a, u32::MAX as usize);
        assert_eq!(b, 7);
    }
}
