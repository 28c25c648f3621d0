//! OCI image support: references, registry access, layouts and configs.

mod image;
pub mod layout;
pub mod reference;
pub mod registry;

pub use image::ImageConfig;
pub use layout::{ManifestRef, OciLayout};
pub use reference::ImageReference;
pub use registry::{OciRegistryTransport, RegistryAuth, RegistryTransport};
