/// Widening casts that can never lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<i32> for u16 {
    fn safe_cast(self) -> i32 {
        self as i32
    }
}

/// For narrowing casts where protocol logic ensures that the value is in the narrower type's range.
/// NB: The implementations panic otherwise, which is a bug in the caller
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}

impl PrecheckedCast<usize> for i32 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
