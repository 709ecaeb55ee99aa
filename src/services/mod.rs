pub mod naming;
pub mod ordering;
pub mod reassembly;
pub mod storage;
