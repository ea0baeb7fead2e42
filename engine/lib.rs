#![deny(dead_code)]
#![deny(unused_imports)]

pub mod bitpattern;
pub mod cache;
pub mod data;
pub mod fdr;
pub mod nifti;
pub mod permute;
pub mod scan;
pub mod stats;
pub mod volume;
