pub mod sector_buf;

pub use sector_buf::SectorBuf;
