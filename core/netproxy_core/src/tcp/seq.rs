//! Wrapping 32-bit sequence number arithmetic (RFC 1982 style)

#[inline]
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn le(a: u32, b: u32) -> bool {
    a == b || lt(a, b)
}

#[inline]
pub fn gt(a: u32, b: u32) -> bool {
    lt(b, a)
}

#[inline]
pub fn ge(a: u32, b: u32) -> bool {
    le(b, a)
}

/// Distance from `from` forward to `to`
#[inline]
pub fn delta(to: u32, from: u32) -> u32 {
    to.wrapping_sub(from)
}

/// `start <= seq < start + len`
#[inline]
pub fn in_window(seq: u32, start: u32, len: u32) -> bool {
    delta(seq, start) < len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_comparisons() {
        assert!(lt(1, 2));
        assert!(lt(u32::MAX - 5, 3));
        assert!(gt(3, u32::MAX - 5));
        assert!(le(7, 7) && ge(7, 7));
        assert_eq!(delta(3, u32::MAX - 1), 5);
    }

    #[test]
    fn test_in_window() {
        assert!(in_window(100, 100, 10));
        assert!(in_window(109, 100, 10));
        assert!(!in_window(110, 100, 10));
        assert!(!in_window(99, 100, 10));
        assert!(in_window(2, u32::MAX - 2, 10));
    }
}
