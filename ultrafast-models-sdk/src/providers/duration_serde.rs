//! Re-export of the canonical duration serde helpers in `crate::common::duration_serde`.
//! Kept here so existing `#[serde(with = "crate::providers::duration_serde")]` call sites
//! keep resolving.

pub use crate::common::duration_serde::{deserialize, serialize};
