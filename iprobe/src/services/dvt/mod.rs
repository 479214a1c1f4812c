//! Instruments services over the DTX protocol

pub mod application_listing;
pub mod device_info;
pub mod graphics;
pub mod instruments;
pub mod message;
pub mod networking;
pub mod process_control;
pub mod remote_server;
pub mod sysmontap;
pub mod value;

pub use instruments::InstrumentsClient;
pub use remote_server::{Channel, RemoteServerClient};
pub use value::{DtxValue, RemoteError};
