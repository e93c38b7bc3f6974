//! Small cross-cutting helpers shared by the SDK's provider and circuit-breaker modules.

pub mod duration_serde;
