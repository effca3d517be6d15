#![doc = include_str!("../README.md")]

mod error;

pub mod bits;
pub mod config;
pub mod decom;
pub mod derive;
pub mod dict;
pub mod dispatch;
pub mod eu;
pub mod evr;
pub mod header;
pub mod input;
pub mod lad;
pub mod monitor;
pub mod msg;
pub mod publish;
pub mod sfdu;
pub mod time;
pub mod value;

pub use error::{Error, Result};

pub type Apid = u16;
pub type Vcid = u16;
pub type Scid = u16;
