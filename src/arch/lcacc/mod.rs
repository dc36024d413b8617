pub mod copy_engine;
pub mod delay;
pub mod dma_ctrl;
pub mod dma_model;
pub mod error;
pub mod iommu;
pub mod main;
pub mod mshr;
pub mod net;
pub mod program;
pub mod signal;
pub mod spm;
pub mod tlb;
pub mod transfer;
pub mod workload;

pub use dma_ctrl::{BlockTransfer, DmaController, DmaStats};
pub use main::{create_simulation, SimHandles};
