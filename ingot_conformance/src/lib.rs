// Copyright 2026 the Ingot Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance suite for `ingot`; see `tests/conformance.rs`.
