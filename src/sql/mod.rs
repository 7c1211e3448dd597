/// SQL statement AST and its text renderer.
///
/// ```text
/// Populated scope tree
///       ↓
/// Emitter (compiler/emitter.rs)
///       ↓
/// Statement AST   (types.rs)
///       ↓
/// Renderer        (render.rs)
///       ↓
/// SQL text
/// ```
pub mod render;
pub mod types;

pub use render::render;
pub use types::*;
