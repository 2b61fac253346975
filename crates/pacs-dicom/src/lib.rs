//! # DICOM协议传输模块
//!
//! 提供三个协议族的客户端传输实现：DICOMweb (QIDO-RS/WADO-RS/STOW-RS)、
//! 传统WADO-URI，以及基于可替换关联后端的DIMSE (C-ECHO/C-FIND/C-GET/C-STORE)。

pub mod dicomweb;
pub mod dimse;
pub mod tags;
pub mod transport;
pub mod wado;

pub use dicomweb::DicomWebTransport;
pub use dimse::{DimseBackend, DimseRequest, DimseResponse, DimseStatus, DimseTransport, TcpProbeBackend};
pub use transport::{DefaultTransportFactory, PacsTransport, TransportFactory, TransportSettings};
pub use wado::WadoTransport;
