pub mod builder;
pub mod registry;

pub use builder::{build_sections, BuildInputs};
pub use registry::SectionRegistry;
