// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance test crate for the `stepstack` VM. See `tests/conformance.rs`.
