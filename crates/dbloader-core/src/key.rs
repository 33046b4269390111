//! Keys that can be bound as parameters of a batched `IN` query.

use crate::value::Value;
use std::fmt::Debug;
use std::hash::Hash;

/// A cache key that flattens into one or more SQL parameters.
///
/// Scalar keys bind one parameter; tuples bind one parameter per element,
/// in order, so `(company_id, sku)` matches a two-column key.
pub trait SqlKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Number of parameters a single key binds.
    const ARITY: usize;

    /// Append this key's parameters to `out`.
    fn push_values(&self, out: &mut Vec<Value>);

    /// This key's parameters as a fresh vector.
    fn to_values(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(Self::ARITY);
        self.push_values(&mut out);
        out
    }
}

macro_rules! scalar_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SqlKey for $ty {
                const ARITY: usize = 1;

                fn push_values(&self, out: &mut Vec<Value>) {
                    out.push(Value::from(self.clone()));
                }
            }
        )*
    };
}

scalar_key!(bool, i32, i64, String, [u8; 16]);

macro_rules! tuple_key {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: SqlKey),+> SqlKey for ($($name,)+) {
            const ARITY: usize = $arity;

            fn push_values(&self, out: &mut Vec<Value>) {
                $(self.$idx.push_values(out);)+
            }
        }
    };
}

tuple_key!(A::ARITY + B::ARITY; A: 0, B: 1);
tuple_key!(A::ARITY + B::ARITY + C::ARITY; A: 0, B: 1, C: 2);
tuple_key!(A::ARITY + B::ARITY + C::ARITY + D::ARITY; A: 0, B: 1, C: 2, D: 3);
