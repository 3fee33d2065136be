#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate lazy_static;

pub mod archive;
pub mod build;
pub mod checksum;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod log;
pub mod manager;
pub mod oneshot;
pub mod plugin;
pub mod runtime;
pub mod worker;

pub use anyhow::{anyhow, Context as ErrContext, Error, Result};
pub use error::EngineError;

#[macro_export]
macro_rules! err {
    ($it:ident) => {
       Err(Error::msg($it))
    };
    ($lit:literal) => {
        Err(Error::msg($lit))
    };
    ($($tt:tt)*) => {
        Err(Error::msg(format!($($tt)*)))
    };
}
