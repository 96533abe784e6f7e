// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference builtin libraries.
//!
//! Each library is a [`BuiltinLibrary`](crate::builtin::BuiltinLibrary) of
//! `const` [`Builtin`](crate::builtin::Builtin)s; programs use whichever
//! members a frontend wires in, and the dumper resolves their qualified names
//! through the same constants.

pub mod bits;
pub mod debug;
pub mod heap;
pub mod int;
pub mod limits;
pub mod test;
