#![allow(dead_code)]

pub mod assertions;
pub mod doubles;
pub mod vectors;
