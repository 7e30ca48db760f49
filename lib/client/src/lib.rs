pub use account_fetcher::*;
pub use bank::*;
pub use client::*;
pub use composer::*;
pub use config::*;
pub use decimal::*;
pub use error::*;
pub use margin_account::*;
pub use observation::*;
pub use util::*;
pub use utp::{UtpAccount, UtpIndex};

mod account_fetcher;
mod bank;
mod client;
mod composer;
mod config;
mod decimal;
mod error;
pub mod error_tracking;
pub mod gpa;
pub mod instructions;
mod margin_account;
mod observation;
pub mod state;
mod util;
pub mod utp;

#[macro_use]
extern crate derive_builder;
