//! Strongly-typed identifiers used across the optimizer.
//!
//! Plans, rules and the scheduler never pass raw integers around for nodes or
//! variables. Node ids are allocated per plan, variable ids per query; both
//! start at 1 and are never reused by their allocator.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident, $alloc:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        #[doc = concat!("Hands out increasing [`", stringify!($name), "`]s.")]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $alloc(u64);

        impl $alloc {
            /// Continue after `last`; the next id is `last + 1`.
            pub const fn after(last: u64) -> Self {
                Self(last)
            }

            pub fn next(&mut self) -> $name {
                self.0 += 1;
                $name(self.0)
            }

            /// The id `next` will return, without allocating it.
            pub const fn peek(&self) -> $name {
                $name(self.0 + 1)
            }

            pub const fn allocated(&self) -> u64 {
                self.0
            }
        }
    };
}

new_id!(NodeId, NodeIdAllocator);
new_id!(VariableId, VariableIdAllocator);
