// Copyright 2026 the Stepstack Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bench-only crate for the `stepstack` VM. See `benches/vm.rs`.
