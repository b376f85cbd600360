pub mod color;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use color::{default_color_classes, ColorBackend, ColorClass, HsvRange};
pub use stub::{ScriptHandle, ScriptedBackend};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
