pub mod assembly;
pub mod boundary;
pub mod coloring;
pub mod config;
pub mod dof;
pub mod element;
pub mod error;
pub mod kernel;
pub mod linear_solver;
pub mod material;
pub mod mesh;
pub mod problem;
pub mod quadrature;
pub mod solver;
pub mod stepping;

pub mod optimize {
    pub use multifem_optimize::*;
}

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
