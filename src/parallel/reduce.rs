//! Element-wise reduction operators.
//!
//! A [`ReduceOp`] names the combine function; [`Reducible`] supplies the
//! identity and the combine step per element type, so the collective layer
//! never inspects element types at run time.

use crate::error::{KError, Result};
use num_traits::{Bounded, Float, One, Zero};
use std::fmt;

/// Associative combine operator applied element-wise across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Prod,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Logical (bool) or bitwise (integer) and.
    And,
    /// Logical (bool) or bitwise (integer) or.
    Or,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::And => "and",
            ReduceOp::Or => "or",
        })
    }
}

/// Element types that can take part in a reduction.
pub trait Reducible: Copy + Send + 'static {
    /// Whether `op` is defined for this element type.
    fn supports(op: ReduceOp) -> bool;
    /// Neutral element of `op`.
    fn identity(op: ReduceOp) -> Self;
    /// Combine two elements. Only called for supported operators.
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn supports(_op: ReduceOp) -> bool {
                    true
                }
                #[inline]
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Or => <$ty as Zero>::zero(),
                        ReduceOp::Prod => <$ty as One>::one(),
                        ReduceOp::Min => <$ty as Bounded>::max_value(),
                        ReduceOp::Max => <$ty as Bounded>::min_value(),
                        ReduceOp::And => !<$ty as Zero>::zero(),
                    }
                }
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        ReduceOp::And => a & b,
                        ReduceOp::Or => a | b,
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn supports(op: ReduceOp) -> bool {
                    !matches!(op, ReduceOp::And | ReduceOp::Or)
                }
                #[inline]
                fn identity(op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::And | ReduceOp::Or => <$ty as Zero>::zero(),
                        ReduceOp::Prod => <$ty as One>::one(),
                        ReduceOp::Min => <$ty as Float>::infinity(),
                        ReduceOp::Max => <$ty as Float>::neg_infinity(),
                    }
                }
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        // NaN wins
                        _ if a.is_nan() || b.is_nan() => <$ty as Float>::nan(),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                        ReduceOp::And | ReduceOp::Or => a,
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
impl_reducible!(float: f32, f64);

// bool behaves as {0, 1}: sum and max saturate to or, product and min to and.
impl Reducible for bool {
    #[inline]
    fn supports(_op: ReduceOp) -> bool {
        true
    }
    #[inline]
    fn identity(op: ReduceOp) -> Self {
        matches!(op, ReduceOp::Prod | ReduceOp::Min | ReduceOp::And)
    }
    #[inline]
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum | ReduceOp::Max | ReduceOp::Or => a || b,
            ReduceOp::Prod | ReduceOp::Min | ReduceOp::And => a && b,
        }
    }
}

/// Reject operators that are undefined for `T` before any communication.
pub fn check_supported<T: Reducible>(op: ReduceOp) -> Result<()> {
    if T::supports(op) {
        Ok(())
    } else {
        Err(KError::Unsupported("bitwise reduction on floating-point data"))
    }
}

/// Fold `contribution` into `acc` element-wise.
pub fn fold<T: Reducible>(op: ReduceOp, acc: &mut [T], contribution: &[T]) {
    for (a, &c) in acc.iter_mut().zip(contribution) {
        *a = T::combine(*a, c, op);
    }
}

/// Reduce per-rank contributions in rank order 0..P.
///
/// The result is seeded with the identity and every contribution is folded
/// in ascending rank order, so floating-point results depend only on the
/// rank order and never on arrival order.
pub fn reduce_in_rank_order<'a, T, I>(op: ReduceOp, len: usize, parts: I) -> Vec<T>
where
    T: Reducible,
    I: IntoIterator<Item = &'a [T]>,
{
    let mut acc = vec![T::identity(op); len];
    for part in parts {
        fold(op, &mut acc, part);
    }
    acc
}
