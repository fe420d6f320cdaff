// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: attention masks and character-to-token positioning.

pub mod masks;
pub mod positioning;
