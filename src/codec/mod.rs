pub mod aac;
pub mod amf;
pub mod avc;
pub mod flv;

pub use aac::AacConfig;
pub use avc::AvcConfig;
